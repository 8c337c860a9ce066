//! 链写出器：把待发送链排空到连接上。
//!
//! # 模块定位（Why）
//! - 输出路径的最后一步，负责把内存缓冲与文件区间交给传输层，并精确记录传输层实际接受了多少；
//! - 部分写、背压与后台文件发送都可能在任意字节处打断排空过程，记账必须能跨调用延续。
//!
//! # 状态机（How）
//! - `Active`：待发送链为空即空闲，否则处于排空中；
//! - `Offloaded`：文件发送已交给后台线程，等待 [`ChainWriter::complete_offload`]；
//! - `Failed`：传输层报错后的终止状态，之后的写入一律返回 [`WriteError::Failed`]。
//!
//! # 契约（What）
//! - 字节严格按节点追加顺序交给传输层；
//! - 每轮发送后用 [`chain_update_sent`] 推进链，已排空的节点退回池的节点缓存；
//! - 缓冲本身的回收由其所有者（例如编排器）通过忙/闲链完成，写出器只持有节点副本。

use std::io::{self, IoSlice};

use spark_buffer::{Chain, LinkId, Pool, chain_add_copy, chain_coalesce_file, chain_update_sent};
use tracing::{debug, trace, warn};

use crate::{
    config::WriterConfig,
    error::{OutputError, WriteError},
    io::{SendOutcome, Transport},
    output::{FilterStatus, OutputFilter},
};

/// 单次聚集写最多携带的内存片段数。
pub const MAX_IOVS: usize = 64;

/// 一次 [`ChainWriter::write`] 调用的结果。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteStatus {
    /// 待发送链已全部排空。
    Complete,
    /// 本次写出了 `sent` 字节后停止：传输层只接受了部分数据，或本次预算已用完。
    Partial { sent: u64 },
    /// 传输层暂不可写，本次没有写出任何字节。
    WouldBlock,
    /// 文件发送仍在后台线程中进行。
    Offloaded,
    /// 待发送量不足 [`WriterConfig::postpone_output`]，本次不发送，等待更多输入。
    Postponed { pending: u64 },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum WriterState {
    Active,
    Offloaded { len: u64 },
    Failed,
}

/// 单连接的链写出器。
///
/// # 契约说明（What）
/// - **单一所有者**：由处理该连接的任务独占驱动，`pool` 必须与写入链的节点来自同一个池；
/// - **预算**：[`WriterConfig::limit`] 限制单次调用写出的字节数，0 表示不限；
/// - **终止性**：一旦返回 [`WriteError::Transport`]，写出器不再调用传输层。
pub struct ChainWriter<T> {
    transport: T,
    config: WriterConfig,
    pending: Chain,
    sent: u64,
    state: WriterState,
}

impl<T: Transport> ChainWriter<T> {
    pub fn new(transport: T, config: WriterConfig) -> Self {
        Self {
            transport,
            config,
            pending: Chain::new(),
            sent: 0,
            state: WriterState::Active,
        }
    }

    /// 追加 `input` 并尽可能排空待发送链。
    ///
    /// # 执行逻辑（How）
    /// 1. 以节点副本的形式把 `input` 追加到待发送链尾部；
    /// 2. 链首为文件区间时合并相邻区间后调用一次 `send_file`，否则聚集至多 [`MAX_IOVS`] 个内存片段调用 `send`；
    /// 3. 按接受量推进链；接受量不足提交量、预算用完或传输层暂不可写时结束本次调用。
    ///
    /// # 返回值（What）
    /// - `Complete`：链已空；`Partial`：有进展但未写完；`WouldBlock`：本次毫无进展；`Offloaded`：等待后台完成。
    /// - `Postponed`：待发送量不足 `postpone_output`，数据留在链上等待后续输入。
    pub fn write(&mut self, pool: &mut Pool, input: &Chain) -> Result<WriteStatus, WriteError> {
        if self.state == WriterState::Failed {
            return Err(WriteError::Failed { sent: self.sent });
        }
        chain_add_copy(pool, &mut self.pending, input)?;
        if let WriterState::Offloaded { len } = self.state {
            trace!(len, "write while offloaded send_file in flight");
            return Ok(WriteStatus::Offloaded);
        }
        if let Some(pending) = self.postponed(pool, input) {
            trace!(pending, threshold = self.config.postpone_output, "output postponed");
            return Ok(WriteStatus::Postponed { pending });
        }
        self.drain(pool)
    }

    /// 判断本次是否暂缓发送，返回待发送字节数。
    ///
    /// 只在带来新输入时暂缓；链上出现 flush、last_buf 或 `recycled` 缓冲时立即发送，
    /// 可回收缓冲要尽快排空才能回到其所有者的空闲链。
    fn postponed(&self, pool: &Pool, input: &Chain) -> Option<u64> {
        let threshold = self.config.postpone_output;
        if threshold == 0 || input.is_empty() {
            return None;
        }
        let mut pending = 0u64;
        for id in self.pending.bufs(pool) {
            let buf = pool.buf(id);
            if buf.flags.flush || buf.flags.last_buf || buf.flags.recycled {
                return None;
            }
            pending += buf.size();
        }
        (pending < threshold).then_some(pending)
    }

    /// 后台文件发送完成的回调入口。
    ///
    /// 成功时按接受量推进链，写出器回到 `Active`，下一次 [`ChainWriter::write`] 继续排空；
    /// 失败时进入终止状态并返回错误。
    pub fn complete_offload(
        &mut self,
        pool: &mut Pool,
        result: io::Result<u64>,
    ) -> Result<(), WriteError> {
        let WriterState::Offloaded { len } = self.state else {
            warn!("offload completion without an offloaded send");
            return Ok(());
        };
        match result {
            Ok(accepted) => {
                self.state = WriterState::Active;
                self.account(pool, accepted.min(len));
                Ok(())
            }
            Err(source) => Err(self.fail(source)),
        }
    }

    fn drain(&mut self, pool: &mut Pool) -> Result<WriteStatus, WriteError> {
        let budget = self.config.budget();
        let mut sent_now = 0u64;

        loop {
            self.drop_drained(pool);
            let Some(head) = self.pending.head() else {
                trace!(sent_now, total = self.sent, "pending chain drained");
                return Ok(WriteStatus::Complete);
            };
            let remaining = budget - sent_now;
            if remaining == 0 {
                debug!(sent_now, "write budget exhausted");
                return Ok(WriteStatus::Partial { sent: sent_now });
            }

            let (outcome, offered) = if pool.buf(pool.link_buf(head)).in_file() {
                self.send_file_run(pool, head, remaining)
            } else {
                self.send_memory_run(pool, head, remaining)
            };

            match outcome {
                Ok(SendOutcome::Accepted(0)) | Ok(SendOutcome::WouldBlock) => {
                    trace!(sent_now, "transport would block");
                    return Ok(if sent_now == 0 {
                        WriteStatus::WouldBlock
                    } else {
                        WriteStatus::Partial { sent: sent_now }
                    });
                }
                Ok(SendOutcome::Accepted(n)) => {
                    let n = n.min(offered);
                    self.account(pool, n);
                    sent_now += n;
                    if n < offered {
                        trace!(offered, accepted = n, "short write");
                        return Ok(WriteStatus::Partial { sent: sent_now });
                    }
                }
                Ok(SendOutcome::Offloaded) => {
                    debug!(len = offered, "send_file offloaded");
                    self.state = WriterState::Offloaded { len: offered };
                    return Ok(WriteStatus::Offloaded);
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(source) => return Err(self.fail(source)),
            }
        }
    }

    /// 合并链首的文件区间并发送，返回传输层回答与提交的字节数。
    fn send_file_run(
        &mut self,
        pool: &Pool,
        head: LinkId,
        remaining: u64,
    ) -> (io::Result<SendOutcome>, u64) {
        let Some(span) = pool.buf(pool.link_buf(head)).file_span() else {
            return (Ok(SendOutcome::Accepted(0)), 0);
        };
        let cap = remaining.min(self.config.max_sendfile_chunk);
        let mut cursor = Some(head);
        let len = chain_coalesce_file(pool, &mut cursor, cap).min(cap);
        trace!(file = span.file.name(), offset = span.pos, len, "send_file");
        (self.transport.send_file(&span.file, span.pos, len), len)
    }

    /// 聚集链首连续的内存片段并发送，遇到文件区间、片段数上限或预算即停止。
    fn send_memory_run(
        &mut self,
        pool: &Pool,
        head: LinkId,
        remaining: u64,
    ) -> (io::Result<SendOutcome>, u64) {
        let mut iovs: Vec<IoSlice<'_>> = Vec::new();
        let mut offered = 0u64;
        let mut cursor = Some(head);
        while let Some(link) = cursor {
            if iovs.len() == MAX_IOVS || offered == remaining {
                break;
            }
            let buf = pool.link_buf(link);
            if pool.buf(buf).in_file() {
                break;
            }
            let bytes = pool.memory(buf);
            if !bytes.is_empty() {
                let take = usize::try_from(remaining - offered)
                    .unwrap_or(usize::MAX)
                    .min(bytes.len());
                iovs.push(IoSlice::new(&bytes[..take]));
                offered += take as u64;
            }
            cursor = pool.next(link);
        }
        trace!(iovs = iovs.len(), offered, "send");
        (self.transport.send(&iovs), offered)
    }

    fn account(&mut self, pool: &mut Pool, n: u64) {
        let head = chain_update_sent(pool, self.pending.head(), n);
        self.pending.release_until(pool, head);
        self.sent += n;
    }

    /// 摘掉链首已排空的节点（包括控制标记）。
    fn drop_drained(&mut self, pool: &mut Pool) {
        while let Some(head) = self.pending.head() {
            if pool.buf(pool.link_buf(head)).size() != 0 {
                break;
            }
            if let Some(link) = self.pending.pop_front(pool) {
                pool.free_link(link);
            }
        }
    }

    fn fail(&mut self, source: io::Error) -> WriteError {
        warn!(sent = self.sent, error = %source, "transport failed, writer is terminal");
        self.state = WriterState::Failed;
        WriteError::Transport {
            sent: self.sent,
            source,
        }
    }

    /// 写出器生命周期内传输层累计接受的字节数。
    pub fn sent(&self) -> u64 {
        self.sent
    }

    /// 待发送链上剩余的字节数。
    pub fn pending_bytes(&self, pool: &Pool) -> u64 {
        self.pending.total_size(pool)
    }

    pub fn is_idle(&self, pool: &Pool) -> bool {
        self.state == WriterState::Active && self.pending_bytes(pool) == 0
    }

    pub fn is_failed(&self) -> bool {
        self.state == WriterState::Failed
    }

    pub fn config(&self) -> &WriterConfig {
        &self.config
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }
}

/// 写出器可以直接作为编排器的下游：排空完成或暂缓发送即 `Done`，其余情况均为 `Again`。
impl<T: Transport> OutputFilter for ChainWriter<T> {
    fn output(&mut self, pool: &mut Pool, chain: &Chain) -> Result<FilterStatus, OutputError> {
        match self.write(pool, chain)? {
            WriteStatus::Complete | WriteStatus::Postponed { .. } => Ok(FilterStatus::Done),
            WriteStatus::Partial { .. } | WriteStatus::WouldBlock | WriteStatus::Offloaded => {
                Ok(FilterStatus::Again)
            }
        }
    }
}
