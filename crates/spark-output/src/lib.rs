#![deny(unsafe_code)]
//! # spark-output
//!
//! ## 定位（Why）
//! - 输出数据路径的上半部分：把生产阶段交来的缓冲链按目的端约束规整（[`OutputChain`]），
//!   再由链写出器（[`ChainWriter`]）排空到连接上；
//! - 缓冲、链表与回收算法来自 `spark-buffer`，本 crate 只负责“何时拷贝、何时透传、何时挂起”。
//!
//! ## 协作者（How）
//! - 连接、文件与临时文件以 trait 注入（[`Transport`]、[`FileIo`]、[`TempFileSink`]），
//!   [`io`] 模块附带基于标准库的参考实现；
//! - 所有挂起都以返回值表达，调用方的事件循环负责重新驱动。
//!
//! ## 配置（What）
//! - [`ChainConfig`] 可从 TOML 解析，字段缺省时取与常见部署一致的默认值。

pub mod config;
pub mod error;
pub mod io;
mod output;
mod writer;

pub use config::{BufsConfig, ChainConfig, DEFAULT_MAX_SENDFILE_CHUNK, OutputConfig, WriterConfig};
pub use error::{ConfigError, OutputError, WriteError};
pub use io::{
    FileIo, FileRead, FsTempFile, ReadMode, SendOutcome, StdFileIo, StreamTransport, TempFileSink,
    Transport,
};
pub use output::{FilterStatus, OutputChain, OutputFilter, OutputStatus};
pub use writer::{ChainWriter, MAX_IOVS, WriteStatus};
