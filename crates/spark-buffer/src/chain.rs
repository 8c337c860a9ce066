//! 链表结构与链表工具算法。
//!
//! # 模块定位（Why）
//! - 生产阶段之间以“缓冲链”为单位传递数据，本模块提供链的最小结构 [`Chain`]，
//!   以及围绕它的五个基础算法：追加拷贝、获取空闲节点、忙/闲链回收、文件区间合并、按已发送字节推进；
//! - 编排器与写出器都只通过这些算法改动链表，保证“部分发送”“节点复用”的记账逻辑集中在一处。
//!
//! # 设计概要（How）
//! - 节点与缓冲都保存在 [`Pool`] 中，[`Chain`] 只记录头尾句柄，可以廉价地移动与拼接；
//! - 所有函数显式接收池引用：同一连接的上下文由单一任务驱动，不需要内部同步。
//!
//! # 契约（What）
//! - 工具函数失败时保持输入结构不变；
//! - 链节点从不归还给基础分配器，只会进入自由链表或池的节点缓存。

use tracing::{trace, warn};

use crate::{
    buf::{Buf, BufContent, BufTag},
    error::ChainError,
    pool::{BufId, LinkId, Pool},
};

/// 单向链表的头尾句柄。
///
/// # 契约说明（What）
/// - `head`/`tail` 同时为 `None` 或同时为 `Some`；
/// - 链本身不拥有节点，节点的生命周期由 [`Pool`] 管理；把链交给别人之前应当 [`Chain::take`]，
///   避免两个 `Chain` 同时修改同一串节点。
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Chain {
    head: Option<LinkId>,
    tail: Option<LinkId>,
}

impl Chain {
    pub const fn new() -> Self {
        Self {
            head: None,
            tail: None,
        }
    }

    /// 以已存在的节点串构造链，尾节点通过遍历求得。
    pub fn from_head(pool: &Pool, head: Option<LinkId>) -> Self {
        let mut tail = head;
        while let Some(link) = tail.and_then(|l| pool.next(l)) {
            tail = Some(link);
        }
        Self { head, tail }
    }

    pub fn head(&self) -> Option<LinkId> {
        self.head
    }

    pub fn tail(&self) -> Option<LinkId> {
        self.tail
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// 取走整条链，原处留下空链。
    pub fn take(&mut self) -> Chain {
        core::mem::take(self)
    }

    /// 节点数量。
    pub fn len(&self, pool: &Pool) -> usize {
        self.links(pool).count()
    }

    /// 遍历节点句柄。
    pub fn links<'a>(&self, pool: &'a Pool) -> Links<'a> {
        Links {
            pool,
            cursor: self.head,
        }
    }

    /// 遍历节点引用的缓冲句柄。
    pub fn bufs<'a>(&self, pool: &'a Pool) -> impl Iterator<Item = BufId> + use<'a> {
        self.links(pool).map(move |link| pool.link_buf(link))
    }

    /// 链上所有缓冲剩余字节之和。
    pub fn total_size(&self, pool: &Pool) -> u64 {
        self.bufs(pool).map(|buf| pool.buf(buf).size()).sum()
    }

    /// 将单个节点挂到链尾，节点的 `next` 会被清空。
    pub fn push_back(&mut self, pool: &mut Pool, link: LinkId) {
        pool.set_next(link, None);
        match self.tail {
            Some(tail) => pool.set_next(tail, Some(link)),
            None => self.head = Some(link),
        }
        self.tail = Some(link);
    }

    /// 摘下头节点并返回，摘下的节点 `next` 被清空。
    pub fn pop_front(&mut self, pool: &mut Pool) -> Option<LinkId> {
        let head = self.head?;
        self.head = pool.next(head);
        if self.head.is_none() {
            self.tail = None;
        }
        pool.set_next(head, None);
        Some(head)
    }

    /// 将 `other` 整体拼接到链尾。
    pub fn append(&mut self, pool: &mut Pool, mut other: Chain) {
        let Some(other_head) = other.head else {
            return;
        };
        match self.tail {
            Some(tail) => pool.set_next(tail, Some(other_head)),
            None => self.head = Some(other_head),
        }
        self.tail = other.tail;
        other.head = None;
        other.tail = None;
    }

    /// 把所有节点退回池的节点缓存，缓冲本身不受影响。
    pub fn release_links(&mut self, pool: &mut Pool) {
        while let Some(link) = self.pop_front(pool) {
            pool.free_link(link);
        }
    }

    /// 持续摘下头节点退回缓存，直到头节点等于 `head`。
    ///
    /// `head` 必须是链上的节点或 `None`（表示释放整条链）。
    pub fn release_until(&mut self, pool: &mut Pool, head: Option<LinkId>) {
        while self.head != head {
            match self.pop_front(pool) {
                Some(link) => pool.free_link(link),
                None => break,
            }
        }
    }
}

/// [`Chain::links`] 返回的迭代器。
pub struct Links<'a> {
    pool: &'a Pool,
    cursor: Option<LinkId>,
}

impl Iterator for Links<'_> {
    type Item = LinkId;

    fn next(&mut self) -> Option<LinkId> {
        let link = self.cursor?;
        self.cursor = self.pool.next(link);
        Some(link)
    }
}

/// 把 `input` 的节点拷贝追加到 `chain` 尾部。
///
/// # 设计初衷（Why）
/// - 下游需要保留上游的缓冲，但不能持有上游的节点：上游随后会重排或复用自己的节点；
/// - 只复制节点、不复制缓冲内容，多个链因此可以别名同一个缓冲。
///
/// # 执行逻辑（How）
/// 1. 先把全部拷贝节点串成独立的临时链，节点来自池的节点缓存，缓存为空才向基础分配器申请；
/// 2. 全部成功后一次性拼接到 `chain` 尾部。
///
/// # 契约说明（What）
/// - **后置条件**：成功时 `chain` 末尾依序追加了与 `input` 等长的新节点，引用相同缓冲；
/// - **失败语义**：返回 [`ChainError::Allocation`] 时 `chain` 与调用前完全一致，已分配的节点退回缓存。
pub fn chain_add_copy(pool: &mut Pool, chain: &mut Chain, input: &Chain) -> Result<(), ChainError> {
    let mut copy = Chain::new();
    let mut cursor = input.head;
    while let Some(link) = cursor {
        cursor = pool.next(link);
        let buf = pool.link_buf(link);
        match pool.alloc_link(buf) {
            Ok(new_link) => copy.push_back(pool, new_link),
            Err(err) => {
                copy.release_links(pool);
                return Err(err);
            }
        }
    }
    chain.append(pool, copy);
    Ok(())
}

/// 从自由链表取一个节点；自由链表为空时分配一个引用空缓冲的新节点。
///
/// 复用的节点保留原缓冲，调用方可以直接复用其内存窗口。返回节点的 `next` 已清空。
pub fn chain_get_free_buf(pool: &mut Pool, free: &mut Chain) -> Result<LinkId, ChainError> {
    if let Some(link) = free.pop_front(pool) {
        return Ok(link);
    }
    let buf = pool.alloc_buf(Buf::empty());
    pool.alloc_link(buf)
}

/// 忙/闲链回收状态机。
///
/// # 设计初衷（Why）
/// - 下游处理完一段数据后，原本交出去的缓冲需要回到自由链表复用，而不是重新分配；
/// - 只有打着本上下文标签的缓冲才可回收，其他子系统的内存绝不能被本上下文重置。
///
/// # 执行逻辑（How）
/// 1. 从 `busy` 头部开始遍历：遇到未消费完（`size != 0`）或标签不匹配的节点立即停止；
/// 2. 对可回收的节点复位缓冲（内存窗口清空、文件区间置为已读完），摘下后压入 `free`；
/// 3. 将 `out` 拼接到 `busy` 尾部并清空 `out`。
///
/// # 契约说明（What）
/// - `busy` 是 FIFO：第 k 个节点未消费完时，其后的节点即使已空也不会被回收；
/// - 不同标签的节点原样留在 `busy` 中，其缓冲不会被复位。
pub fn chain_update_chains(
    pool: &mut Pool,
    free: &mut Chain,
    busy: &mut Chain,
    out: &mut Chain,
    tag: BufTag,
) {
    while let Some(link) = busy.head {
        let buf_id = pool.link_buf(link);
        let buf = pool.buf(buf_id);
        if buf.size() != 0 {
            break;
        }
        if buf.tag != Some(tag) {
            trace!(buf = buf_id.raw(), owner = ?buf.tag, %tag, "busy head owned elsewhere");
            break;
        }

        pool.buf_mut(buf_id).reset();
        let _ = busy.pop_front(pool);
        pool.set_next(link, free.head);
        if free.head.is_none() {
            free.tail = Some(link);
        }
        free.head = Some(link);
    }

    let pending = out.take();
    busy.append(pool, pending);
}

/// 合并链首连续的文件区间，返回合并后的字节数，并把 `cursor` 推进到第一个未合并的节点。
///
/// # 设计初衷（Why）
/// - 多个相邻的小文件缓冲合并为一个大区间后，调用方只需发起一次文件到套接字的传输。
///
/// # 执行逻辑（How）
/// - 链首必须是文件缓冲，否则返回 0 且不移动 `cursor`；
/// - 首个缓冲无条件计入，即便它本身已超过 `limit`（本层不拆分缓冲）；
/// - 后续缓冲必须属于同一文件、`file_pos` 恰好等于上一段的结尾，且并入后总量不超过 `limit`。
///
/// # 契约说明（What）
/// - 返回值仅在单个首缓冲超限时才会大于 `limit`；
/// - 缓冲本身不被修改，调用方发送后仍需按原节点逐个记账（见 [`chain_update_sent`]）。
pub fn chain_coalesce_file(pool: &Pool, cursor: &mut Option<LinkId>, limit: u64) -> u64 {
    let Some(first) = *cursor else {
        return 0;
    };
    let Some(first_span) = pool.buf(pool.link_buf(first)).file_span() else {
        return 0;
    };

    let file = first_span.file.clone();
    let mut total = first_span.len();
    let mut end = first_span.last;
    let mut link = pool.next(first);

    while total < limit {
        let Some(current) = link else {
            break;
        };
        let BufContent::File(span) = &pool.buf(pool.link_buf(current)).content else {
            break;
        };
        if !span.file.same_file(&file) || span.pos != end {
            break;
        }
        let size = span.len();
        if total + size > limit {
            break;
        }
        total += size;
        end = span.last;
        link = pool.next(current);
    }

    *cursor = link;
    total
}

/// 按传输层实际接受的字节数推进链，返回第一个尚未发送完的节点。
///
/// # 执行逻辑（How）
/// - 从 `head` 开始遍历：特殊缓冲与已空缓冲视为瞬间发送完毕，直接跳过；
/// - 剩余 `sent` 不小于当前缓冲大小时，把缓冲推进到末尾并继续；
/// - 否则把缓冲推进 `sent` 字节并停止，该缓冲成为下一次发送的链首。
///
/// # 契约说明（What）
/// - 返回 `None` 表示整条链已发送完；对已发送完的链再次调用是无操作；
/// - `sent` 超过链上剩余字节时多余部分被忽略并记录告警。
pub fn chain_update_sent(pool: &mut Pool, head: Option<LinkId>, mut sent: u64) -> Option<LinkId> {
    let mut cursor = head;
    while let Some(link) = cursor {
        let buf_id = pool.link_buf(link);
        let buf = pool.buf_mut(buf_id);
        let size = buf.size();
        if buf.is_special() || size == 0 {
            cursor = pool.next(link);
            continue;
        }
        if sent == 0 {
            break;
        }
        if sent >= size {
            sent -= size;
            buf.drain();
            cursor = pool.next(link);
            continue;
        }
        buf.consume(sent);
        sent = 0;
        break;
    }

    if sent > 0 {
        warn!(excess = sent, "sent byte count exceeds chain size");
    }
    cursor
}
