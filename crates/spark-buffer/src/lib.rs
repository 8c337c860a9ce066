#![deny(unsafe_code)]

//! `spark-buffer` 提供输出数据路径的缓冲描述符、缓冲链与链表工具算法。
//!
//! # 模块定位（Why）
//! - 生成内容、代理上游字节、静态文件最终都要汇成一条有序字节流交给网络对端，
//!   本 crate 负责描述这些数据片段（内存区间或文件区间）以及把它们串起来的链；
//! - 上层的输出编排器与链写出器（`spark-output`）只通过这里的算法移动、合并与回收缓冲，
//!   从而把“部分发送记账”“节点复用”“所有权标签”等容易出错的逻辑集中管理。
//!
//! # 设计概要（How）
//! - [`Pool`]：请求/连接作用域的分配器，持有区域、描述符与链节点，句柄在作用域内稳定；
//! - [`Buf`]：以 [`BufContent`] 封闭枚举区分控制信号、临时内存、只读内存、映射内存与文件区间；
//! - [`Chain`] 与 `chain_*` 函数：追加拷贝、获取空闲节点、忙/闲链回收、文件区间合并、按已发送字节推进。
//!
//! # 契约（What）
//! - 同一池只由一个任务访问，不做内部同步；
//! - 工具函数失败时保持输入结构不变，错误统一为 [`ChainError`]。

mod buf;
mod chain;
mod error;
mod pool;

pub use buf::{Buf, BufContent, BufFlags, BufTag, FileRef, FileSpan, MemSpan};
pub use chain::{
    Chain, Links, chain_add_copy, chain_coalesce_file, chain_get_free_buf, chain_update_chains,
    chain_update_sent,
};
pub use error::ChainError;
pub use pool::{BufId, Bufs, LinkId, Pool, PoolLimits, PoolStats, RegionId};
