//! 输出路径的错误定义。
//!
//! # 分类（What）
//! - [`OutputError`]：编排器一次提交过程中的致命错误，已经交给下游的输出不会回滚；
//! - [`WriteError`]：写出器的终止性错误，总是携带失败前传输层已接受的字节数；
//! - [`ConfigError`]：配置解析与校验失败。
//!
//! “暂时写不出去”不是错误，而是状态值（见 [`WriteStatus`](crate::WriteStatus)）。

use std::io;

use spark_buffer::ChainError;
use thiserror::Error;

/// 编排器错误。
#[derive(Debug, Error)]
pub enum OutputError {
    /// 节点或临时缓冲分配失败。
    #[error(transparent)]
    Chain(#[from] ChainError),

    /// 读取文件区间失败或读到的字节数不足。
    #[error("读取文件 `{file}` 偏移 {offset} 失败：{source}")]
    FileIo {
        file: String,
        offset: u64,
        #[source]
        source: io::Error,
    },

    /// 内容溢出到临时文件时写入失败。
    #[error("写入临时文件失败：{source}")]
    Spill {
        #[source]
        source: io::Error,
    },

    /// 下游写出器失败。
    #[error(transparent)]
    Write(#[from] WriteError),

    /// 构造编排器时配置校验失败。
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// 写出器错误。
#[derive(Debug, Error)]
pub enum WriteError {
    /// 传输层返回错误，写出器随即进入终止状态。
    #[error("传输层写入失败（此前已发送 {sent} 字节）：{source}")]
    Transport {
        sent: u64,
        #[source]
        source: io::Error,
    },

    /// 写出器已经失败，不再尝试任何写入。
    #[error("写出器已处于失败状态（失败前已发送 {sent} 字节）")]
    Failed { sent: u64 },

    /// 追加待发送节点时分配失败。
    #[error(transparent)]
    Chain(#[from] ChainError),
}

impl WriteError {
    /// 失败前传输层已接受的字节数；分配失败时为 0。
    pub fn sent(&self) -> u64 {
        match self {
            WriteError::Transport { sent, .. } | WriteError::Failed { sent } => *sent,
            WriteError::Chain(_) => 0,
        }
    }
}

/// 配置错误。
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("解析 TOML 配置失败：{0}")]
    Parse(#[from] toml::de::Error),

    /// 临时缓冲数量或大小为 0。
    #[error("输出缓冲规格非法：{num} 个 × {size} 字节")]
    InvalidBufs { num: usize, size: usize },

    #[error("非法的对齐值 {alignment}，必须是 2 的幂")]
    InvalidAlignment { alignment: usize },

    #[error("单次文件发送上限不能为 0")]
    ZeroSendfileChunk,
}
