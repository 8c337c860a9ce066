//! 缓冲与链表层的错误定义。
//!
//! # 设计要求（What）
//! - 所有链表工具函数在失败时“快速失败”，且保持共享结构处于调用前的一致状态；
//! - 错误类型派生 `thiserror::Error`，上层编排器/写出器可直接 `?` 传播或包装。

use thiserror::Error;

use crate::pool::BufId;

/// 链表与池操作的统一错误类型。
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChainError {
    /// 基础分配器无法满足请求，对应作用域级别的内存耗尽。
    ///
    /// - `what`：请求的对象种类（`"region"` 或 `"link"`）；
    /// - `requested`：本次请求的数量（字节或节点数）；
    /// - `limit`：池配置的上限。
    #[error("分配 {what} 失败：请求 {requested}，上限 {limit}")]
    Allocation {
        what: &'static str,
        requested: usize,
        limit: usize,
    },

    /// 对齐参数不是 2 的幂。
    #[error("非法的对齐值 {alignment}，必须是 2 的幂")]
    InvalidAlignment { alignment: usize },

    /// 试图向只读或非内存缓冲写入。
    #[error("缓冲 {buf:?} 不可写")]
    NotWritable { buf: BufId },

    /// 源缓冲内容不在内存中，无法按内存拷贝。
    #[error("缓冲 {buf:?} 的内容不在内存中")]
    NotInMemory { buf: BufId },

    /// 写入超过窗口剩余空间。
    #[error("缓冲 {buf:?} 剩余空间 {room}，请求写入 {requested}")]
    Overflow {
        buf: BufId,
        room: usize,
        requested: usize,
    },
}

impl ChainError {
    /// 是否为分配失败，供上层决定是否升级给连接所有者。
    pub fn is_allocation(&self) -> bool {
        matches!(self, ChainError::Allocation { .. })
    }
}
