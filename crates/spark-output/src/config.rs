//! 输出链与写出器的配置面。
//!
//! # 设计概要（How）
//! - 所有结构派生 `serde::Deserialize` 并整体 `#[serde(default)]`，TOML 中缺省的字段取默认值；
//! - [`ChainConfig::from_toml_str`] 解析后立即 [`ChainConfig::validate`]，非法组合不会流入运行期。
//!
//! ```toml
//! [output]
//! alignment = 4096
//! sendfile = true
//! bufs = { num = 4, size = 16384 }
//!
//! [writer]
//! limit = 65536
//! ```

use serde::Deserialize;
use spark_buffer::Bufs;

use crate::error::ConfigError;

/// 默认的单次文件发送上限：2 GiB 减去一页，与常见内核对单次 `sendfile` 的限制一致。
pub const DEFAULT_MAX_SENDFILE_CHUNK: u64 = 2_147_479_552;

/// 临时缓冲规格：最多 `num` 个、每个 `size` 字节。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BufsConfig {
    pub num: usize,
    pub size: usize,
}

impl Default for BufsConfig {
    fn default() -> Self {
        Self {
            num: 2,
            size: 32 * 1024,
        }
    }
}

impl From<BufsConfig> for Bufs {
    fn from(value: BufsConfig) -> Self {
        Bufs {
            num: value.num,
            size: value.size,
        }
    }
}

/// 编排器对目的端约束的描述。
///
/// - `sendfile`：目的端能否直接传输文件区间；
/// - `need_in_memory`：目的端只接受内存内容；
/// - `need_in_temp`：目的端要求可写的临时内存，只读内存与映射内存也需要拷贝；
/// - `alignment`：直接 I/O 读取时临时缓冲的对齐粒度。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OutputConfig {
    pub bufs: BufsConfig,
    pub alignment: usize,
    pub sendfile: bool,
    pub need_in_memory: bool,
    pub need_in_temp: bool,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            bufs: BufsConfig::default(),
            alignment: 512,
            sendfile: false,
            need_in_memory: false,
            need_in_temp: false,
        }
    }
}

impl OutputConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bufs.num == 0 || self.bufs.size == 0 {
            return Err(ConfigError::InvalidBufs {
                num: self.bufs.num,
                size: self.bufs.size,
            });
        }
        if !self.alignment.is_power_of_two() {
            return Err(ConfigError::InvalidAlignment {
                alignment: self.alignment,
            });
        }
        Ok(())
    }
}

/// 写出器配置。
///
/// - `limit`：单次调用可写出的字节上限，0 表示不限；
/// - `max_sendfile_chunk`：单次文件发送的字节上限；
/// - `postpone_output`：待发送量低于该值且没有 flush、last_buf 或可回收缓冲时暂缓发送，0 表示不暂缓。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WriterConfig {
    pub limit: u64,
    pub max_sendfile_chunk: u64,
    pub postpone_output: u64,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            limit: 0,
            max_sendfile_chunk: DEFAULT_MAX_SENDFILE_CHUNK,
            postpone_output: 0,
        }
    }
}

impl WriterConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_sendfile_chunk == 0 {
            return Err(ConfigError::ZeroSendfileChunk);
        }
        Ok(())
    }

    /// 本次调用的有效预算，`limit == 0` 视为不限。
    pub fn budget(&self) -> u64 {
        if self.limit == 0 {
            u64::MAX
        } else {
            self.limit
        }
    }
}

/// 输出路径的完整配置。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ChainConfig {
    pub output: OutputConfig,
    pub writer: WriterConfig,
}

impl ChainConfig {
    /// 从 TOML 文本解析并校验配置。
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: ChainConfig = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.output.validate()?;
        self.writer.validate()
    }
}
