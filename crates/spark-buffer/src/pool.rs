use bytes::{Bytes, BytesMut};
use tracing::{debug, trace};

use crate::{
    buf::{Buf, BufContent, BufFlags, FileRef, FileSpan, MemSpan},
    chain::Chain,
    error::ChainError,
};

macro_rules! arena_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(u32);

        impl $name {
            /// 以原始下标构造句柄；句柄只在创建它的池内有效。
            pub const fn from_raw(raw: u32) -> Self {
                Self(raw)
            }

            pub const fn raw(self) -> u32 {
                self.0
            }

            fn index(self) -> usize {
                self.0 as usize
            }
        }
    };
}

arena_id!(
    /// 池内内存区域的句柄。
    RegionId
);
arena_id!(
    /// 池内缓冲描述符的句柄，多个链节点可以引用同一个 `BufId`。
    BufId
);
arena_id!(
    /// 池内链节点的句柄。
    LinkId
);

/// 区域存储：可写区域由池独占，只读区域共享外部 `Bytes`。
enum Region {
    Writable(BytesMut),
    Frozen(Bytes),
}

impl Region {
    fn as_slice(&self) -> &[u8] {
        match self {
            Region::Writable(data) => data.as_ref(),
            Region::Frozen(data) => data.as_ref(),
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct Link {
    buf: BufId,
    next: Option<LinkId>,
}

/// 池的容量上限。`None` 表示不限。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolLimits {
    /// 可写区域字节总量上限（含对齐填充）。
    pub max_region_bytes: Option<usize>,
    /// 链节点总数上限（不含从缓存复用的节点）。
    pub max_links: Option<usize>,
}

/// 一次性创建多个临时缓冲的规格：`num` 个、每个 `size` 字节。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Bufs {
    pub num: usize,
    pub size: usize,
}

/// 池的统计快照。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// 当前存活的区域数量。
    pub regions: usize,
    /// 当前可写区域占用的字节数。
    pub region_bytes: usize,
    /// 已创建的缓冲描述符数量。
    pub bufs: usize,
    /// 从基础分配器创建过的链节点数量。
    pub links_allocated: usize,
    /// 节点缓存中待复用的节点数量。
    pub links_cached: usize,
    /// 从节点缓存命中的次数。
    pub link_cache_hits: u64,
}

/// `Pool` 是一个请求/连接作用域的分配器：区域、缓冲描述符与链节点都在此分配，
/// 并在池被丢弃时一次性释放。
///
/// # 模块角色（Why）
/// - 缓冲与链节点之间大量互相引用（别名、影子），以池内下标句柄代替裸指针，
///   既保留“同一存储被多处引用”的表达力，又不需要手工维护指针；
/// - 作用域结束即整体回收，个别缓冲不需要单独取消。
///
/// # 核心机制（How）
/// - `regions`：区域槽位，释放后槽位进入 `free_region_slots` 复用；
/// - `bufs`/`links`：只增不减的描述符与节点数组，句柄在池生命周期内稳定；
/// - `link_cache`：以节点自身 `next` 字段串起来的空闲节点栈，分配节点时优先复用。
///
/// # 契约说明（What）
/// - **单一所有者**：池只由处理该连接的任务访问，所有方法都要求 `&mut self` 或 `&self`，不做内部加锁；
/// - **前置条件**：传入的句柄必须来自同一个池，否则会因越界而 panic；
/// - **后置条件**：分配失败返回 [`ChainError::Allocation`]，池状态保持不变。
///
/// # 设计权衡（Trade-offs）
/// - 描述符和节点永不单独释放，长连接上会随峰值增长；节点通过缓存复用，描述符由上层通过自由链表复用；
/// - 只读区域直接持有调用方给出的 `Bytes`，不计入字节上限。
#[derive(Default)]
pub struct Pool {
    limits: PoolLimits,
    regions: Vec<Option<Region>>,
    free_region_slots: Vec<RegionId>,
    region_bytes: usize,
    bufs: Vec<Buf>,
    links: Vec<Link>,
    link_cache: Option<LinkId>,
    links_cached: usize,
    link_cache_hits: u64,
}

impl Pool {
    /// 创建不设上限的池。
    pub fn new() -> Self {
        Self::default()
    }

    /// 创建带容量上限的池。
    pub fn with_limits(limits: PoolLimits) -> Self {
        Self {
            limits,
            ..Self::default()
        }
    }

    pub fn limits(&self) -> PoolLimits {
        self.limits
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            regions: self.regions.iter().filter(|slot| slot.is_some()).count(),
            region_bytes: self.region_bytes,
            bufs: self.bufs.len(),
            links_allocated: self.links.len(),
            links_cached: self.links_cached,
            link_cache_hits: self.link_cache_hits,
        }
    }

    // ---------------------------------------------------------------------
    // 区域
    // ---------------------------------------------------------------------

    /// 分配一块可写区域，返回区域句柄与对齐后的窗口起点。
    ///
    /// # 契约说明（What）
    /// - `alignment` 必须是 2 的幂，`1` 表示不要求对齐；
    /// - 返回的 `start` 满足区域内存地址按 `alignment` 对齐，窗口 `[start, start + size)` 全部可写；
    /// - 超出 `max_region_bytes` 时返回 [`ChainError::Allocation`]。
    pub fn alloc_region(
        &mut self,
        size: usize,
        alignment: usize,
    ) -> Result<(RegionId, usize), ChainError> {
        if !alignment.is_power_of_two() {
            return Err(ChainError::InvalidAlignment { alignment });
        }
        let padding = alignment - 1;
        let total = size.saturating_add(padding);
        if let Some(limit) = self.limits.max_region_bytes
            && self.region_bytes.saturating_add(total) > limit
        {
            debug!(
                requested = total,
                in_use = self.region_bytes,
                limit,
                "region allocation exceeds pool limit"
            );
            return Err(ChainError::Allocation {
                what: "region",
                requested: total,
                limit,
            });
        }

        let data = BytesMut::zeroed(total);
        let start = data.as_ptr().align_offset(alignment);
        if start > padding {
            return Err(ChainError::InvalidAlignment { alignment });
        }
        self.region_bytes += total;
        let id = self.insert_region(Region::Writable(data));
        trace!(region = id.raw(), size, alignment, start, "region allocated");
        Ok((id, start))
    }

    /// 以只读方式登记外部内存，例如常量响应或缓存块。
    pub fn alloc_frozen(&mut self, data: Bytes) -> RegionId {
        self.insert_region(Region::Frozen(data))
    }

    fn insert_region(&mut self, region: Region) -> RegionId {
        match self.free_region_slots.pop() {
            Some(id) => {
                self.regions[id.index()] = Some(region);
                id
            }
            None => {
                let id = RegionId(self.regions.len() as u32);
                self.regions.push(Some(region));
                id
            }
        }
    }

    /// 归还区域槽位，并把仍指向该区域的描述全部置为无内容。
    ///
    /// 槽位会被后续分配复用，留下的描述若不清空，就会读写到其他缓冲的内存。
    fn release_region(&mut self, id: RegionId) {
        if let Some(region) = self.regions.get_mut(id.index()).and_then(Option::take) {
            if let Region::Writable(data) = &region {
                self.region_bytes = self.region_bytes.saturating_sub(data.len());
            }
            let mut detached = 0usize;
            for buf in &mut self.bufs {
                if buf.mem_span().is_some_and(|span| span.region == id) {
                    buf.content = BufContent::Control;
                    detached += 1;
                }
            }
            self.free_region_slots.push(id);
            trace!(region = id.raw(), detached, "region released");
        }
    }

    // ---------------------------------------------------------------------
    // 缓冲描述符
    // ---------------------------------------------------------------------

    pub fn alloc_buf(&mut self, buf: Buf) -> BufId {
        let id = BufId(self.bufs.len() as u32);
        self.bufs.push(buf);
        id
    }

    pub fn buf(&self, id: BufId) -> &Buf {
        &self.bufs[id.index()]
    }

    pub fn buf_mut(&mut self, id: BufId) -> &mut Buf {
        &mut self.bufs[id.index()]
    }

    /// 创建 `size` 字节的临时缓冲，窗口为空。
    pub fn create_temp_buf(&mut self, size: usize) -> Result<BufId, ChainError> {
        self.create_aligned_temp_buf(size, 1)
    }

    /// 创建窗口起点按 `alignment` 对齐的临时缓冲。
    pub fn create_aligned_temp_buf(
        &mut self,
        size: usize,
        alignment: usize,
    ) -> Result<BufId, ChainError> {
        let (region, start) = self.alloc_region(size, alignment)?;
        Ok(self.alloc_buf(Buf::temporary(MemSpan::empty(region, start, start + size))))
    }

    /// 包装只读内存。
    pub fn memory_buf(&mut self, data: Bytes) -> BufId {
        let len = data.len();
        let region = self.alloc_frozen(data);
        self.alloc_buf(Buf::memory(MemSpan::full(region, len)))
    }

    /// 包装映射自文件的只读内存。
    pub fn mmap_buf(&mut self, data: Bytes) -> BufId {
        let len = data.len();
        let region = self.alloc_frozen(data);
        self.alloc_buf(Buf::mmap(MemSpan::full(region, len)))
    }

    /// 描述文件区间 `[pos, last)`。
    pub fn file_buf(&mut self, file: FileRef, pos: u64, last: u64) -> BufId {
        self.alloc_buf(Buf::file(FileSpan::new(file, pos, last)))
    }

    pub fn control_buf(&mut self, flags: BufFlags) -> BufId {
        self.alloc_buf(Buf::control(flags))
    }

    /// 一次分配 `bufs.num * bufs.size` 字节的区域，切分为 `num` 个临时缓冲并串成链。
    ///
    /// 所有缓冲共享同一块区域，各自占用互不重叠的窗口。
    pub fn create_chain_of_bufs(&mut self, bufs: Bufs) -> Result<Chain, ChainError> {
        let total = bufs.num.saturating_mul(bufs.size);
        let (region, base) = self.alloc_region(total, 1)?;
        let mut chain = Chain::new();
        for i in 0..bufs.num {
            let start = base + i * bufs.size;
            let buf = self.alloc_buf(Buf::temporary(MemSpan::empty(
                region,
                start,
                start + bufs.size,
            )));
            match self.alloc_link(buf) {
                Ok(link) => chain.push_back(self, link),
                Err(err) => {
                    chain.release_links(self);
                    self.release_region(region);
                    return Err(err);
                }
            }
        }
        Ok(chain)
    }

    // ---------------------------------------------------------------------
    // 内存访问
    // ---------------------------------------------------------------------

    /// 返回缓冲尚未消费的内存字节 `[pos, last)`；非内存缓冲或区域已释放时为空切片。
    pub fn memory(&self, id: BufId) -> &[u8] {
        let Some(span) = self.buf(id).mem_span() else {
            return &[];
        };
        match self.regions.get(span.region.index()).and_then(Option::as_ref) {
            Some(region) => &region.as_slice()[span.pos..span.last],
            None => &[],
        }
    }

    /// 返回临时缓冲窗口尾部的可写空间 `[last, end)`。
    pub fn spare_mut(&mut self, id: BufId) -> Result<&mut [u8], ChainError> {
        let span = match &self.bufs[id.index()].content {
            BufContent::Temporary(span) => *span,
            _ => return Err(ChainError::NotWritable { buf: id }),
        };
        match self
            .regions
            .get_mut(span.region.index())
            .and_then(Option::as_mut)
        {
            Some(Region::Writable(data)) => Ok(&mut data[span.last..span.end]),
            _ => Err(ChainError::NotWritable { buf: id }),
        }
    }

    /// 确认已向 [`Pool::spare_mut`] 返回的空间写入了 `n` 字节。
    pub fn commit(&mut self, id: BufId, n: usize) -> Result<(), ChainError> {
        let buf = &mut self.bufs[id.index()];
        let writable = buf.is_writable();
        match buf.mem_span_mut() {
            Some(span) if writable => {
                if n > span.room() {
                    return Err(ChainError::Overflow {
                        buf: id,
                        room: span.room(),
                        requested: n,
                    });
                }
                span.last += n;
                Ok(())
            }
            _ => Err(ChainError::NotWritable { buf: id }),
        }
    }

    /// 向临时缓冲追加字节，返回实际写入量（受窗口剩余空间限制）。
    pub fn append(&mut self, id: BufId, data: &[u8]) -> Result<usize, ChainError> {
        let spare = self.spare_mut(id)?;
        let n = spare.len().min(data.len());
        spare[..n].copy_from_slice(&data[..n]);
        self.commit(id, n)?;
        Ok(n)
    }

    /// 将 `src` 的前 `n` 个未消费字节拷贝到临时缓冲 `dst` 的尾部，不推进 `src`。
    ///
    /// # 契约说明（What）
    /// - `src` 必须位于内存，`dst` 必须是 `Temporary`；
    /// - `n` 超过 `src` 剩余量时截断；超过 `dst` 剩余空间时返回 [`ChainError::Overflow`]；
    /// - 两者共享同一区域时按重叠安全的方式拷贝。
    pub fn copy_memory(&mut self, src: BufId, dst: BufId, n: usize) -> Result<usize, ChainError> {
        let src_span = *self
            .buf(src)
            .mem_span()
            .ok_or(ChainError::NotInMemory { buf: src })?;
        let dst_span = match &self.buf(dst).content {
            BufContent::Temporary(span) => *span,
            _ => return Err(ChainError::NotWritable { buf: dst }),
        };
        let n = n.min(src_span.len());
        if n > dst_span.room() {
            return Err(ChainError::Overflow {
                buf: dst,
                room: dst_span.room(),
                requested: n,
            });
        }

        let (a, b) = (src_span.region.index(), dst_span.region.index());
        let src_range = src_span.pos..src_span.pos + n;
        if a == b {
            match self.regions[b].as_mut() {
                Some(Region::Writable(data)) => data.copy_within(src_range, dst_span.last),
                _ => return Err(ChainError::NotWritable { buf: dst }),
            }
        } else {
            let (src_slot, dst_slot) = if a < b {
                let (lo, hi) = self.regions.split_at_mut(b);
                (&lo[a], &mut hi[0])
            } else {
                let (lo, hi) = self.regions.split_at_mut(a);
                (&hi[0], &mut lo[b])
            };
            let source = match src_slot {
                Some(region) => &region.as_slice()[src_range],
                None => return Err(ChainError::NotInMemory { buf: src }),
            };
            match dst_slot {
                Some(Region::Writable(data)) => {
                    data[dst_span.last..dst_span.last + n].copy_from_slice(source)
                }
                _ => return Err(ChainError::NotWritable { buf: dst }),
            }
        }
        self.commit(dst, n)?;
        Ok(n)
    }

    // ---------------------------------------------------------------------
    // 影子缓冲
    // ---------------------------------------------------------------------

    /// 创建描述同一存储的影子缓冲。
    ///
    /// # 契约说明（What）
    /// - 新缓冲复制 `src` 的内容与标签，`shadow` 指回 `src`，并接管 `last_shadow` 标记；
    /// - `src` 若尚无影子，则指向新缓冲，从而双方都知道自己属于影子组；
    /// - 整个影子组只有带 `last_shadow` 的那个缓冲能通过 [`Pool::release_buf`] 真正释放存储。
    pub fn shadow_buf(&mut self, src: BufId) -> BufId {
        let mut copy = self.buf(src).clone();
        copy.shadow = Some(src);
        copy.flags.last_shadow = true;
        let id = self.alloc_buf(copy);

        let original = self.buf_mut(src);
        original.flags.last_shadow = false;
        if original.shadow.is_none() {
            original.shadow = Some(id);
        }
        id
    }

    /// 释放缓冲所引用的内存区域，返回是否真正释放了存储。
    ///
    /// # 执行逻辑（How）
    /// - 影子组中非 `last_shadow` 的成员只清空自身描述，存储保持有效；
    /// - 无影子或带 `last_shadow` 的缓冲释放区域，同组其他描述随之变为无内容，
    ///   此后读取到的是空切片，区域槽位被复用后也不会别名到新缓冲；
    /// - 文件与控制缓冲不持有区域，直接返回 `false`。
    pub fn release_buf(&mut self, id: BufId) -> bool {
        let buf = self.buf(id);
        let Some(span) = buf.mem_span().copied() else {
            return false;
        };
        let terminal = buf.shadow.is_none() || buf.flags.last_shadow;
        self.buf_mut(id).content = BufContent::Control;
        if !terminal {
            trace!(buf = id.raw(), "shadow member released without storage");
            return false;
        }
        self.release_region(span.region);
        true
    }

    // ---------------------------------------------------------------------
    // 链节点
    // ---------------------------------------------------------------------

    /// 分配引用 `buf` 的链节点：优先复用节点缓存，缓存为空时才向基础分配器申请。
    pub fn alloc_link(&mut self, buf: BufId) -> Result<LinkId, ChainError> {
        if let Some(link) = self.link_cache {
            self.link_cache = self.links[link.index()].next;
            self.links_cached -= 1;
            self.link_cache_hits += 1;
            self.links[link.index()] = Link { buf, next: None };
            return Ok(link);
        }
        if let Some(limit) = self.limits.max_links
            && self.links.len() >= limit
        {
            debug!(limit, "link allocation exceeds pool limit");
            return Err(ChainError::Allocation {
                what: "link",
                requested: 1,
                limit,
            });
        }
        let link = LinkId(self.links.len() as u32);
        self.links.push(Link { buf, next: None });
        Ok(link)
    }

    /// 将节点放回节点缓存。节点此后不得再被任何链引用。
    pub fn free_link(&mut self, link: LinkId) {
        self.links[link.index()].next = self.link_cache;
        self.link_cache = Some(link);
        self.links_cached += 1;
    }

    /// 节点引用的缓冲。
    pub fn link_buf(&self, link: LinkId) -> BufId {
        self.links[link.index()].buf
    }

    /// 节点的后继。
    pub fn next(&self, link: LinkId) -> Option<LinkId> {
        self.links[link.index()].next
    }

    pub(crate) fn set_next(&mut self, link: LinkId, next: Option<LinkId>) {
        self.links[link.index()].next = next;
    }

    /// 依次为 `bufs` 分配节点并串成链；任一节点分配失败时已分配的节点全部退回缓存。
    pub fn chain_of(&mut self, bufs: &[BufId]) -> Result<Chain, ChainError> {
        let mut chain = Chain::new();
        for &buf in bufs {
            match self.alloc_link(buf) {
                Ok(link) => chain.push_back(self, link),
                Err(err) => {
                    chain.release_links(self);
                    return Err(err);
                }
            }
        }
        Ok(chain)
    }
}
