//! 输出链编排器。
//!
//! # 模块定位（Why）
//! - 生产阶段交来的链可能是只读内存、映射内存、文件区间，甚至是未对齐的直接 I/O 文件；
//!   下游（通常是 [`ChainWriter`](crate::ChainWriter)）则对内容形态有约束；
//! - 编排器按目的端约束规整输入：满足约束的节点零拷贝透传，其余内容拷贝进临时缓冲，
//!   内存受限时溢出到临时文件。
//!
//! # 执行逻辑（How）
//! - 输入节点以副本形式排入内部 `input` 队列，逐个判断：
//!   1. 控制标记或满足约束的缓冲：先关闭正在填充的临时缓冲，再原样移入本轮输出；
//!   2. 需要拷贝的缓冲：拷贝进当前临时缓冲，多个小缓冲共用一个临时缓冲，满了或遇到 flush/last 标记才关闭；
//!   3. 临时缓冲用尽且配置了溢出目标：内存内容写入临时文件，以文件区间缓冲转发；
//! - 每轮把输出交给下游，随后用忙/闲链算法回收下游已消费的临时缓冲，直到输入耗尽或无法继续。
//!
//! # 挂起点（What）
//! - 临时缓冲全部在途且无空闲时返回 [`OutputStatus::Again`]，待下游消费后再次 `submit`；
//! - 文件协作者以 `Pending` 回答读取时返回 [`OutputStatus::Pending`]，
//!   直到协作者调用 [`OutputChain::resume`] 之前不再接受新的读取。

use std::io;

use spark_buffer::{
    Buf, BufFlags, BufId, BufTag, Chain, ChainError, LinkId, Pool, chain_add_copy,
    chain_get_free_buf, chain_update_chains,
};
use tracing::{debug, trace, warn};

use crate::{
    config::OutputConfig,
    error::OutputError,
    io::{FileIo, FileRead, ReadMode, TempFileSink},
};

/// 下游过滤器对一次输出的回答。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FilterStatus {
    /// 已全部接收并处理完毕。
    Done,
    /// 已接收，但仍有数据滞留在下游，稍后需要再次驱动。
    Again,
}

/// 编排器的下游接口。
///
/// 下游通过推进缓冲的 `pos`/`file_pos` 告知哪些内容已经消费，编排器据此回收临时缓冲；
/// 下游不得持有 `chain` 的节点本身，需要保留时应当拷贝节点（见 [`chain_add_copy`]）。
pub trait OutputFilter {
    fn output(&mut self, pool: &mut Pool, chain: &Chain) -> Result<FilterStatus, OutputError>;
}

impl<F> OutputFilter for F
where
    F: FnMut(&mut Pool, &Chain) -> Result<FilterStatus, OutputError>,
{
    fn output(&mut self, pool: &mut Pool, chain: &Chain) -> Result<FilterStatus, OutputError> {
        self(pool, chain)
    }
}

/// 一次 [`OutputChain::submit`] 的结果。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputStatus {
    /// 输入已全部交给下游，且下游最后一次回答 `Done`。
    Done,
    /// 仍有输入滞留或下游尚未排空，需要再次驱动。
    Again,
    /// 正在等待异步文件读取完成。
    Pending,
}

impl From<FilterStatus> for OutputStatus {
    fn from(value: FilterStatus) -> Self {
        match value {
            FilterStatus::Done => OutputStatus::Done,
            FilterStatus::Again => OutputStatus::Again,
        }
    }
}

/// 获取临时缓冲的结果。
enum Scratch {
    Ready,
    /// 本轮已有输出，先交给下游再分配。
    Deferred,
    /// 配额用尽且没有空闲缓冲。
    Exhausted,
}

/// 单个请求/流的输出链上下文。
///
/// # 结构说明（How）
/// - `input`：尚未处理完的输入节点副本；
/// - `scratch`：正在填充的临时缓冲节点；
/// - `free`/`busy`：本上下文临时缓冲的空闲链与在途链，回收只认 `tag`；
/// - `allocated`：已向池申请的临时缓冲数量，不超过 `config.bufs.num`；
/// - `directio`/`unaligned`：遇到直接 I/O 文件后临时缓冲按 `config.alignment` 对齐，
///   `unaligned` 表示下一次读取需要走普通读取以补齐对齐边界；
/// - `aio`：异步读取在途。
///
/// # 契约说明（What）
/// - **顺序**：交给下游的字节顺序与输入追加顺序一致，透传节点之前的临时缓冲总是先被关闭；
/// - **失败**：分配失败、文件读取或溢出失败直接返回，已交给下游的输出不回滚；
/// - **单一所有者**：上下文与 `pool` 由同一任务驱动。
pub struct OutputChain<F, R> {
    tag: BufTag,
    config: OutputConfig,
    filter: F,
    file_io: R,
    spill: Option<Box<dyn TempFileSink>>,
    input: Chain,
    free: Chain,
    busy: Chain,
    scratch: Option<LinkId>,
    allocated: usize,
    directio: bool,
    unaligned: bool,
    aio: bool,
}

impl<F: OutputFilter, R: FileIo> OutputChain<F, R> {
    /// 以回收标签 `tag` 创建上下文；`tag` 必须与其他子系统的标签不同。
    ///
    /// 配置先经 [`OutputConfig::validate`] 校验，零个或零字节的临时缓冲、非 2 的幂的对齐值
    /// 以 [`OutputError::Config`] 拒绝。
    pub fn new(
        tag: BufTag,
        config: OutputConfig,
        filter: F,
        file_io: R,
    ) -> Result<Self, OutputError> {
        config.validate()?;
        Ok(Self {
            tag,
            config,
            filter,
            file_io,
            spill: None,
            input: Chain::new(),
            free: Chain::new(),
            busy: Chain::new(),
            scratch: None,
            allocated: 0,
            directio: false,
            unaligned: false,
            aio: false,
        })
    }

    /// 配置临时缓冲用尽时的溢出目标。
    ///
    /// 仅在目的端接受文件区间（`sendfile`）且不要求内存内容时生效。
    pub fn with_spill(mut self, sink: impl TempFileSink + 'static) -> Self {
        self.spill = Some(Box::new(sink));
        self
    }

    /// 提交一条输入链。
    ///
    /// # 执行逻辑（How）
    /// - 快速路径：没有滞留输入、没有在途缓冲时，空链或单个满足约束的节点直接交给下游；
    /// - 否则拷贝节点进入 `input` 队列，循环“规整 → 交给下游 → 回收”，直到本轮没有新输出。
    ///
    /// # 契约说明（What）
    /// - `input` 的节点不会被编排器占用，调用方可以立即复用；缓冲内容在下游消费前不得改写；
    /// - 返回 `Again` 时剩余输入保存在上下文中，以空链再次调用即可继续。
    pub fn submit(&mut self, pool: &mut Pool, input: &Chain) -> Result<OutputStatus, OutputError> {
        if self.aio {
            chain_add_copy(pool, &mut self.input, input)?;
            trace!(tag = %self.tag, "submit while file read pending");
            return Ok(OutputStatus::Pending);
        }

        if self.input.is_empty() && self.busy.is_empty() && self.scratch.is_none() {
            if input.is_empty() {
                return Ok(self.filter.output(pool, input)?.into());
            }
            if input.head() == input.tail()
                && let Some(head) = input.head()
                && self.conforms(pool.buf(pool.link_buf(head)))
            {
                trace!(tag = %self.tag, "short path pass through");
                return Ok(self.filter.output(pool, input)?.into());
            }
        }

        chain_add_copy(pool, &mut self.input, input)?;

        let mut out = Chain::new();
        let mut last: Option<FilterStatus> = None;
        loop {
            if !self.aio {
                self.fill(pool, &mut out)?;
            }
            if out.is_empty() {
                if self.aio {
                    debug!(tag = %self.tag, "waiting for file read completion");
                    return Ok(OutputStatus::Pending);
                }
                if let Some(status) = last {
                    if !self.input.is_empty() {
                        return Ok(OutputStatus::Again);
                    }
                    return Ok(status.into());
                }
            }

            let status = self.filter.output(pool, &out)?;
            self.retire(pool, &mut out);
            last = Some(status);
        }
    }

    /// 异步读取完成的回调入口；之后的 `submit` 会重新发起该读取。
    pub fn resume(&mut self) {
        if self.aio {
            trace!(tag = %self.tag, "file read completed");
        }
        self.aio = false;
    }

    /// 规整 `input` 队列，把可以交给下游的节点按顺序放入 `out`。
    fn fill(&mut self, pool: &mut Pool, out: &mut Chain) -> Result<(), OutputError> {
        while let Some(link) = self.input.head() {
            let src = pool.link_buf(link);
            let buf = pool.buf(src);

            if buf.size() == 0 && !buf.is_special() {
                warn!(tag = %self.tag, buf = src.raw(), "zero size buf in output");
                self.drop_input_head(pool);
                continue;
            }

            if self.conforms(buf) {
                self.close_scratch(pool, out);
                if let Some(node) = self.input.pop_front(pool) {
                    trace!(tag = %self.tag, buf = src.raw(), "pass through");
                    out.push_back(pool, node);
                }
                continue;
            }

            // 直接 I/O 读取要求从对齐的缓冲起点开始。
            if buf.file_span().is_some_and(|span| span.file.directio())
                && let Some(scratch) = self.scratch
                && pool.buf(pool.link_buf(scratch)).size() > 0
            {
                self.close_scratch(pool, out);
            }

            if self.scratch.is_none() {
                match self.open_scratch(pool, src, out)? {
                    Scratch::Ready => {}
                    Scratch::Deferred => break,
                    Scratch::Exhausted => {
                        if self.try_spill(pool, out)? {
                            continue;
                        }
                        debug!(
                            tag = %self.tag,
                            allocated = self.allocated,
                            "scratch buffers exhausted"
                        );
                        break;
                    }
                }
            }
            let Some(scratch) = self.scratch else {
                break;
            };
            let dst = pool.link_buf(scratch);

            if !self.copy(pool, src, dst)? {
                self.aio = true;
                break;
            }

            let mut close = pool.buf(dst).mem_span().is_some_and(|span| span.room() == 0);
            if pool.buf(src).size() == 0 {
                let flags = pool.buf(src).flags;
                let dst_flags = &mut pool.buf_mut(dst).flags;
                dst_flags.flush |= flags.flush;
                dst_flags.last_buf |= flags.last_buf;
                dst_flags.last_in_chain |= flags.last_in_chain;
                close |= flags.flush || flags.last_buf || flags.last_in_chain;
                self.drop_input_head(pool);
            }
            if close {
                self.close_scratch(pool, out);
            }
        }

        if self.input.is_empty() {
            self.close_scratch(pool, out);
        }
        Ok(())
    }

    /// 缓冲是否可以不经拷贝直接交给下游。
    fn conforms(&self, buf: &Buf) -> bool {
        if buf.is_special() {
            return true;
        }
        if let Some(span) = buf.file_span()
            && span.file.directio()
        {
            return false;
        }
        if !self.config.sendfile && !buf.in_memory() {
            return false;
        }
        if self.config.need_in_memory && !buf.in_memory() {
            return false;
        }
        if self.config.need_in_temp && buf.in_memory() && !buf.is_writable() {
            return false;
        }
        true
    }

    /// 为 `src` 准备临时缓冲：对齐头部缓冲、空闲链、或新分配，依次尝试。
    fn open_scratch(
        &mut self,
        pool: &mut Pool,
        src: BufId,
        out: &Chain,
    ) -> Result<Scratch, OutputError> {
        if self.align_file_buf(pool, src)? {
            return Ok(Scratch::Ready);
        }

        if !self.free.is_empty() {
            let link = chain_get_free_buf(pool, &mut self.free)?;
            let buf = pool.buf_mut(pool.link_buf(link));
            buf.flags = BufFlags {
                recycled: buf.flags.recycled,
                ..BufFlags::default()
            };
            trace!(tag = %self.tag, "reuse scratch buf from free list");
            self.scratch = Some(link);
            return Ok(Scratch::Ready);
        }

        if !out.is_empty() {
            return Ok(Scratch::Deferred);
        }
        if self.allocated == self.config.bufs.num {
            return Ok(Scratch::Exhausted);
        }

        match self.get_buf(pool, src) {
            Ok(()) => Ok(Scratch::Ready),
            Err(err) if err.is_allocation() && self.can_spill(pool.buf(src)) => {
                debug!(tag = %self.tag, error = %err, "scratch allocation failed, spilling");
                Ok(Scratch::Exhausted)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// 分配一个新的临时缓冲。
    ///
    /// 源缓冲是本段链的最后一块且小于配置尺寸（单缓冲配置下放宽到 1.25 倍，直接 I/O 除外）时，
    /// 临时缓冲恰好按源大小分配，且不标记 `recycled`。
    fn get_buf(&mut self, pool: &mut Pool, src: BufId) -> Result<(), ChainError> {
        let buf = pool.buf(src);
        let bsize = buf.size();
        let mut size = self.config.bufs.size;
        let mut recycled = true;

        if buf.flags.last_in_chain || buf.flags.last_buf {
            let quarter = (size + size / 4) as u64;
            if bsize < size as u64
                || (!self.directio && self.config.bufs.num == 1 && bsize < quarter)
            {
                size = bsize as usize;
                recycled = false;
            }
        }

        let id = if self.directio {
            pool.create_aligned_temp_buf(size, self.config.alignment)?
        } else {
            pool.create_temp_buf(size)?
        };
        let scratch = pool.buf_mut(id);
        scratch.tag = Some(self.tag);
        scratch.flags.recycled = recycled;
        let link = pool.alloc_link(id)?;

        self.scratch = Some(link);
        self.allocated += 1;
        debug!(
            tag = %self.tag,
            size,
            recycled,
            aligned = self.directio,
            allocated = self.allocated,
            "scratch buf allocated"
        );
        Ok(())
    }

    /// 直接 I/O 文件的对齐处理。
    ///
    /// 文件位置未对齐时分配一个小缓冲，读到下一个对齐边界为止；位置已对齐但剩余不足一个临时缓冲时，
    /// 按剩余大小分配。这两种读取都走普通读取。该缓冲不带回收标签，用后不进入空闲链。
    fn align_file_buf(&mut self, pool: &mut Pool, src: BufId) -> Result<bool, ChainError> {
        let Some(span) = pool.buf(src).file_span() else {
            return Ok(false);
        };
        if !span.file.directio() {
            return Ok(false);
        }
        self.directio = true;

        let bsize = span.len();
        let alignment = self.config.alignment as u64;
        let misalign = span.pos & (alignment - 1);
        let size = if misalign == 0 {
            if bsize >= self.config.bufs.size as u64 {
                return Ok(false);
            }
            bsize
        } else {
            (alignment - misalign).min(bsize)
        };

        let id = pool.create_temp_buf(size as usize)?;
        let link = pool.alloc_link(id)?;
        self.scratch = Some(link);
        self.unaligned = true;
        trace!(tag = %self.tag, size, "unaligned directio head");
        Ok(true)
    }

    /// 把 `src` 的内容尽量拷贝进 `dst`，返回 `false` 表示文件读取尚未完成。
    fn copy(&mut self, pool: &mut Pool, src: BufId, dst: BufId) -> Result<bool, OutputError> {
        let room = pool.buf(dst).mem_span().map_or(0, |span| span.room());
        let source = pool.buf(src);
        let size = usize::try_from(source.size()).unwrap_or(usize::MAX).min(room);

        if source.in_memory() {
            let n = pool.copy_memory(src, dst, size)?;
            pool.buf_mut(src).consume(n as u64);
            return Ok(true);
        }

        let Some(span) = source.file_span() else {
            return Ok(true);
        };
        let file = span.file.clone();
        let offset = span.pos;
        let mode = if file.directio() && !self.unaligned {
            ReadMode::Direct
        } else {
            ReadMode::Buffered
        };
        let file_error = |source: io::Error| OutputError::FileIo {
            file: file.name().to_owned(),
            offset,
            source,
        };

        let spare = pool.spare_mut(dst)?;
        let read = self
            .file_io
            .read(&file, offset, &mut spare[..size], mode)
            .map_err(file_error)?;
        let n = match read {
            FileRead::Pending => {
                debug!(tag = %self.tag, file = file.name(), offset, size, "file read pending");
                return Ok(false);
            }
            FileRead::Ready(n) => n,
        };
        if n != size {
            return Err(file_error(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("只读到 {n} / {size} 字节"),
            )));
        }
        pool.commit(dst, n)?;
        pool.buf_mut(src).consume(n as u64);
        self.unaligned = false;
        trace!(tag = %self.tag, file = file.name(), offset, n, ?mode, "file read into scratch");
        Ok(true)
    }

    fn can_spill(&self, buf: &Buf) -> bool {
        self.spill.is_some()
            && self.config.sendfile
            && !self.config.need_in_memory
            && buf.in_memory()
    }

    /// 把队首的内存内容写入临时文件，以文件区间缓冲转发。
    fn try_spill(&mut self, pool: &mut Pool, out: &mut Chain) -> Result<bool, OutputError> {
        let Some(link) = self.input.head() else {
            return Ok(false);
        };
        let src = pool.link_buf(link);
        if !self.can_spill(pool.buf(src)) {
            return Ok(false);
        }
        let Some(sink) = self.spill.as_mut() else {
            return Ok(false);
        };

        let span = sink
            .append(pool.memory(src))
            .map_err(|source| OutputError::Spill { source })?;
        let src_flags = pool.buf(src).flags;
        let flags = BufFlags {
            flush: src_flags.flush,
            last_buf: src_flags.last_buf,
            last_in_chain: src_flags.last_in_chain,
            temp_file: true,
            ..BufFlags::default()
        };
        let len = span.len();
        let spilled = pool.alloc_buf(Buf::file(span).with_flags(flags));
        let node = pool.alloc_link(spilled)?;

        pool.buf_mut(src).drain();
        self.drop_input_head(pool);
        out.push_back(pool, node);
        debug!(tag = %self.tag, len, "spilled to temp file");
        Ok(true)
    }

    /// 关闭当前临时缓冲：有内容则移入 `out`，空缓冲退回空闲链。
    fn close_scratch(&mut self, pool: &mut Pool, out: &mut Chain) {
        let Some(link) = self.scratch.take() else {
            return;
        };
        let buf = pool.buf(pool.link_buf(link));
        if buf.size() > 0 {
            out.push_back(pool, link);
        } else if buf.tag == Some(self.tag) {
            self.free.push_back(pool, link);
        } else {
            pool.free_link(link);
        }
    }

    fn drop_input_head(&mut self, pool: &mut Pool) {
        if let Some(link) = self.input.pop_front(pool) {
            pool.free_link(link);
        }
    }

    /// 下游处理完本轮输出后回收：透传的外来节点退回节点缓存，本标签的临时缓冲进入忙/闲链。
    ///
    /// `chain_update_chains` 先扫描 `busy` 再拼接本轮输出，本轮已被下游排空的临时缓冲
    /// 要再扫描一次才能进入空闲链，否则下一轮规整会误判为配额用尽。
    fn retire(&mut self, pool: &mut Pool, out: &mut Chain) {
        let mut own = Chain::new();
        while let Some(link) = out.pop_front(pool) {
            if pool.buf(pool.link_buf(link)).tag == Some(self.tag) {
                own.push_back(pool, link);
            } else {
                pool.free_link(link);
            }
        }
        chain_update_chains(pool, &mut self.free, &mut self.busy, &mut own, self.tag);
        chain_update_chains(pool, &mut self.free, &mut self.busy, &mut own, self.tag);
    }

    pub fn tag(&self) -> BufTag {
        self.tag
    }

    pub fn config(&self) -> &OutputConfig {
        &self.config
    }

    /// 已分配的临时缓冲数量。
    pub fn allocated(&self) -> usize {
        self.allocated
    }

    /// 是否在等待异步文件读取。
    pub fn is_pending(&self) -> bool {
        self.aio
    }

    /// 尚未处理完的输入字节数。
    pub fn queued_bytes(&self, pool: &Pool) -> u64 {
        self.input.total_size(pool)
    }

    /// 已交给下游但尚未消费完的临时缓冲数量。
    pub fn busy_len(&self, pool: &Pool) -> usize {
        self.busy.len(pool)
    }

    pub fn filter(&self) -> &F {
        &self.filter
    }

    pub fn filter_mut(&mut self) -> &mut F {
        &mut self.filter
    }

    pub fn file_io(&self) -> &R {
        &self.file_io
    }

    pub fn into_filter(self) -> F {
        self.filter
    }
}
