use std::{fmt, fs::File, sync::Arc};

use crate::pool::{BufId, RegionId};

/// 标识缓冲内存归属的回收标签。
///
/// # 设计初衷（Why）
/// - 同一个 [`Buf`] 可能被多条链引用，只有“拥有者”子系统可以把它放回自由链表复用；
/// - 以 `&'static str` 作为标签值，既能做廉价的等值比较，也能直接出现在 tracing 字段中，便于排障。
///
/// # 契约说明（What）
/// - 标签按值比较，两个子系统必须使用不同的字符串；
/// - 由生产者在构造缓冲时写入 [`Buf::tag`]，回收算法只认该字段。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BufTag(&'static str);

impl BufTag {
    /// 以静态名称构造标签。
    pub const fn new(name: &'static str) -> Self {
        Self(name)
    }

    /// 返回标签名称。
    pub const fn name(&self) -> &'static str {
        self.0
    }
}

impl fmt::Display for BufTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

/// 文件对象句柄：描述文件区间缓冲所引用的文件。
///
/// # 设计动机（Why）
/// - 文件区间缓冲本身只记录偏移量，真正的读取/发送由外部文件协作者完成；
/// - 句柄需要在多个缓冲之间廉价共享，因此内部采用 `Arc`。
///
/// # 结构说明（How）
/// - `id`：协作者识别文件的稳定编号，合并相邻文件区间时以此判断“是否同一文件”；
/// - `name`：仅用于日志；
/// - `handle`：可选的标准库 `File`，供基于 `std` 的适配器执行定位读写；
/// - `directio`：该文件是否以直接 I/O 打开，决定编排器是否需要对齐读取。
#[derive(Clone)]
pub struct FileRef {
    inner: Arc<FileMeta>,
    directio: bool,
}

struct FileMeta {
    id: u64,
    name: String,
    handle: Option<File>,
}

impl FileRef {
    /// 构造不携带操作系统句柄的文件引用，读取由调用方注入的协作者按 `id` 解析。
    pub fn new(id: u64, name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(FileMeta {
                id,
                name: name.into(),
                handle: None,
            }),
            directio: false,
        }
    }

    /// 包装已打开的标准库文件。
    pub fn from_std(id: u64, name: impl Into<String>, file: File) -> Self {
        Self {
            inner: Arc::new(FileMeta {
                id,
                name: name.into(),
                handle: Some(file),
            }),
            directio: false,
        }
    }

    /// 返回标记了直接 I/O 的副本。
    pub fn with_directio(mut self, directio: bool) -> Self {
        self.directio = directio;
        self
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn directio(&self) -> bool {
        self.directio
    }

    /// 返回底层标准库文件（若存在）。
    pub fn handle(&self) -> Option<&File> {
        self.inner.handle.as_ref()
    }

    /// 两个引用是否指向同一文件。
    pub fn same_file(&self, other: &FileRef) -> bool {
        self.inner.id == other.inner.id
    }
}

impl fmt::Debug for FileRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileRef")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("directio", &self.directio)
            .finish()
    }
}

/// 内存区间：`[pos, last)` 位于某块已分配区域的窗口 `[start, end)` 之内。
///
/// - `start`/`end`：缓冲可使用的整段窗口，多个缓冲可能共享同一块区域的不同窗口；
/// - `pos`/`last`：尚未被消费的数据区间，恒满足 `start <= pos <= last <= end`。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemSpan {
    pub region: RegionId,
    pub start: usize,
    pub end: usize,
    pub pos: usize,
    pub last: usize,
}

impl MemSpan {
    /// 覆盖整个窗口的满区间，用于包装只读内容。
    pub fn full(region: RegionId, len: usize) -> Self {
        Self {
            region,
            start: 0,
            end: len,
            pos: 0,
            last: len,
        }
    }

    /// 空区间：窗口 `[start, end)`，尚无数据。
    pub fn empty(region: RegionId, start: usize, end: usize) -> Self {
        Self {
            region,
            start,
            end,
            pos: start,
            last: start,
        }
    }

    pub fn len(&self) -> usize {
        self.last - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.pos == self.last
    }

    /// 窗口尾部剩余的可写字节数。
    pub fn room(&self) -> usize {
        self.end - self.last
    }
}

/// 文件区间 `[pos, last)`。
#[derive(Clone, Debug)]
pub struct FileSpan {
    pub file: FileRef,
    pub pos: u64,
    pub last: u64,
}

impl FileSpan {
    pub fn new(file: FileRef, pos: u64, last: u64) -> Self {
        debug_assert!(pos <= last, "file span must not be inverted");
        Self { file, pos, last }
    }

    pub fn len(&self) -> u64 {
        self.last - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.pos == self.last
    }
}

/// 缓冲内容的封闭枚举。
///
/// # 设计动机（Why）
/// - 以“内容种类”取代一组相互独立的布尔标志，使“既在文件中又持有内存数据”这类非法组合无法构造；
/// - 可变性直接体现在变体上：只有 `Temporary` 允许编排器写入。
///
/// # 变体说明（What）
/// - `Control`：不含数据的控制信号（仅携带 flush/last_buf/sync 标志）；
/// - `Temporary`：可变的临时内存，由持有者自由改写；
/// - `Memory`：只读内存，例如常量或缓存块；
/// - `Mmap`：从文件映射而来的只读内存；
/// - `File`：文件区间。
#[derive(Clone, Debug)]
pub enum BufContent {
    Control,
    Temporary(MemSpan),
    Memory(MemSpan),
    Mmap(MemSpan),
    File(FileSpan),
}

/// 缓冲状态标志。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BufFlags {
    /// 被消费后即可提前复用。
    pub recycled: bool,
    /// 即使不是链尾也强制输出。
    pub flush: bool,
    /// 无内容的同步标记。
    pub sync: bool,
    /// 整个逻辑消息的最后一个缓冲。
    pub last_buf: bool,
    /// 当前链片段的最后一个缓冲；`last_buf` 蕴含 `last_in_chain`。
    pub last_in_chain: bool,
    /// 影子组中负责真正释放存储的那一个。
    pub last_shadow: bool,
    /// 内存受限时溢出到临时文件的内容。
    pub temp_file: bool,
}

/// `Buf` 描述一段连续字节：要么位于内存，要么位于文件，绝不同时两者。
///
/// # 角色定位（Why）
/// - 生产阶段、编排器与写出器之间传递的最小数据单元；
/// - 自身只是描述符，真正的内存由 [`Pool`](crate::Pool) 中的区域持有，通过 [`RegionId`] 引用。
///
/// # 契约说明（What）
/// - `size()`：内存内容为 `last - pos`，文件内容为 `file_last - file_pos`，控制信号为 0；
/// - `shadow`：若存在，表示另一个描述同一存储的缓冲；释放规则见 [`Pool::release_buf`](crate::Pool::release_buf)；
/// - `tag`：回收标签，`None` 表示不归任何回收者所有。
#[derive(Clone, Debug)]
pub struct Buf {
    pub content: BufContent,
    pub flags: BufFlags,
    pub tag: Option<BufTag>,
    pub shadow: Option<BufId>,
}

impl Buf {
    /// 无任何标志的空控制缓冲，相当于清零后的描述符。
    pub fn empty() -> Self {
        Self::control(BufFlags::default())
    }

    pub fn control(flags: BufFlags) -> Self {
        Self {
            content: BufContent::Control,
            flags,
            tag: None,
            shadow: None,
        }
    }

    pub fn temporary(span: MemSpan) -> Self {
        Self::with_content(BufContent::Temporary(span))
    }

    pub fn memory(span: MemSpan) -> Self {
        Self::with_content(BufContent::Memory(span))
    }

    pub fn mmap(span: MemSpan) -> Self {
        Self::with_content(BufContent::Mmap(span))
    }

    pub fn file(span: FileSpan) -> Self {
        Self::with_content(BufContent::File(span))
    }

    fn with_content(content: BufContent) -> Self {
        Self {
            content,
            flags: BufFlags::default(),
            tag: None,
            shadow: None,
        }
    }

    pub fn with_tag(mut self, tag: BufTag) -> Self {
        self.tag = Some(tag);
        self
    }

    pub fn with_flags(mut self, flags: BufFlags) -> Self {
        self.flags = flags;
        self
    }

    /// 返回内存区间（若内容位于内存）。
    pub fn mem_span(&self) -> Option<&MemSpan> {
        match &self.content {
            BufContent::Temporary(span) | BufContent::Memory(span) | BufContent::Mmap(span) => {
                Some(span)
            }
            BufContent::Control | BufContent::File(_) => None,
        }
    }

    pub(crate) fn mem_span_mut(&mut self) -> Option<&mut MemSpan> {
        match &mut self.content {
            BufContent::Temporary(span) | BufContent::Memory(span) | BufContent::Mmap(span) => {
                Some(span)
            }
            BufContent::Control | BufContent::File(_) => None,
        }
    }

    /// 返回文件区间（若内容位于文件）。
    pub fn file_span(&self) -> Option<&FileSpan> {
        match &self.content {
            BufContent::File(span) => Some(span),
            _ => None,
        }
    }

    pub fn in_memory(&self) -> bool {
        self.mem_span().is_some()
    }

    /// 内容只在内存中。内容枚举保证内存与文件互斥，因此与 [`Buf::in_memory`] 等价。
    pub fn in_memory_only(&self) -> bool {
        self.in_memory()
    }

    pub fn in_file(&self) -> bool {
        matches!(self.content, BufContent::File(_))
    }

    /// 内容是否允许原地改写。
    pub fn is_writable(&self) -> bool {
        matches!(self.content, BufContent::Temporary(_))
    }

    /// 只携带 flush/last_buf/sync 标志、不含任何内容的特殊缓冲。
    pub fn is_special(&self) -> bool {
        matches!(self.content, BufContent::Control)
            && (self.flags.flush || self.flags.last_buf || self.flags.sync)
    }

    /// 仅有 sync 标志的特殊缓冲。
    pub fn is_sync_only(&self) -> bool {
        matches!(self.content, BufContent::Control)
            && self.flags.sync
            && !self.flags.flush
            && !self.flags.last_buf
    }

    /// 剩余未消费的字节数。
    pub fn size(&self) -> u64 {
        match &self.content {
            BufContent::Control => 0,
            BufContent::Temporary(span) | BufContent::Memory(span) | BufContent::Mmap(span) => {
                span.len() as u64
            }
            BufContent::File(span) => span.len(),
        }
    }

    /// 将读位置推进 `n` 字节，`n` 超出剩余量时截断到末尾。
    pub fn consume(&mut self, n: u64) {
        match &mut self.content {
            BufContent::Control => {}
            BufContent::Temporary(span) | BufContent::Memory(span) | BufContent::Mmap(span) => {
                let step = usize::try_from(n).unwrap_or(usize::MAX).min(span.len());
                span.pos += step;
            }
            BufContent::File(span) => {
                span.pos += n.min(span.len());
            }
        }
    }

    /// 标记为完全消费：`pos = last` / `file_pos = file_last`。
    pub fn drain(&mut self) {
        match &mut self.content {
            BufContent::Control => {}
            BufContent::Temporary(span) | BufContent::Memory(span) | BufContent::Mmap(span) => {
                span.pos = span.last;
            }
            BufContent::File(span) => span.pos = span.last,
        }
    }

    /// 回收前复位：内存窗口清空为 `pos = last = start`，文件区间置为 `file_pos = file_last`。
    pub fn reset(&mut self) {
        match &mut self.content {
            BufContent::Control => {}
            BufContent::Temporary(span) | BufContent::Memory(span) | BufContent::Mmap(span) => {
                span.pos = span.start;
                span.last = span.start;
            }
            BufContent::File(span) => span.pos = span.last,
        }
    }
}
