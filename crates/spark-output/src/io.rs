//! 输出路径消费的外部协作者接口，以及基于标准库的参考适配器。
//!
//! # 模块定位（Why）
//! - 编排器与写出器不管理连接、文件与事件循环的生命周期，只通过三个窄接口与外界交互：
//!   [`Transport`]（把字节或文件区间交给连接）、[`FileIo`]（读取文件区间）、[`TempFileSink`]（溢出到临时文件）；
//! - 挂起点都以返回值表达（`WouldBlock`/`Offloaded`/`Pending`），调用方负责在就绪后重新驱动，从不阻塞等待。
//!
//! # 适配器（How）
//! - [`StreamTransport`]：包装任意 `std::io::Write`，`send` 走 `write_vectored`，`send_file` 以定位读 + 写的方式回退；
//! - [`StdFileIo`]：对 [`FileRef::handle`] 执行定位读，直接 I/O 与普通读取在此层不作区分；
//! - [`FsTempFile`]：把溢出内容追加到磁盘文件，返回可供写出器发送的文件区间。

use std::{
    fs::{File, OpenOptions},
    io::{self, IoSlice, Write},
    path::Path,
};

use spark_buffer::{FileRef, FileSpan};
use tracing::trace;

/// 传输层对一次发送请求的回答。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SendOutcome {
    /// 接受了给定字节数，可能少于提交量。
    Accepted(u64),
    /// 当前无法接受任何数据，等待可写后重试。
    WouldBlock,
    /// 文件发送已交给后台线程，完成后由协作者回调写出器。
    Offloaded,
}

/// 连接的发送原语。
pub trait Transport {
    /// 聚集写：按顺序发送 `bufs` 中的字节。
    fn send(&mut self, bufs: &[IoSlice<'_>]) -> io::Result<SendOutcome>;

    /// 发送文件区间 `[offset, offset + len)`。
    fn send_file(&mut self, file: &FileRef, offset: u64, len: u64) -> io::Result<SendOutcome>;
}

/// 文件读取方式。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReadMode {
    /// 经过页缓存的普通读取，用于直接 I/O 文件未对齐的头尾部分。
    Buffered,
    /// 直接 I/O：目标内存与偏移均已按配置对齐。
    Direct,
}

/// 一次文件读取的结果。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileRead {
    /// 同步完成，读到的字节数。
    Ready(usize),
    /// 已提交异步读取，完成后协作者调用 [`OutputChain::resume`](crate::OutputChain::resume)。
    Pending,
}

/// 文件协作者。
pub trait FileIo {
    fn read(
        &mut self,
        file: &FileRef,
        offset: u64,
        dst: &mut [u8],
        mode: ReadMode,
    ) -> io::Result<FileRead>;
}

/// 临时文件溢出目标。
pub trait TempFileSink {
    /// 追加 `data`，返回其在临时文件中的区间。
    fn append(&mut self, data: &[u8]) -> io::Result<FileSpan>;
}

/// 基于 `std::io::Write` 的传输层适配器。
///
/// `send_file` 通过 [`FileRef::handle`] 定位读取至多 `chunk` 字节再写出，写出量即为接受量。
#[derive(Debug)]
pub struct StreamTransport<W> {
    inner: W,
    chunk: usize,
}

impl<W: Write> StreamTransport<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            chunk: 64 * 1024,
        }
    }

    pub fn get_ref(&self) -> &W {
        &self.inner
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> Transport for StreamTransport<W> {
    fn send(&mut self, bufs: &[IoSlice<'_>]) -> io::Result<SendOutcome> {
        match self.inner.write_vectored(bufs) {
            Ok(n) => Ok(SendOutcome::Accepted(n as u64)),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(SendOutcome::WouldBlock),
            Err(err) => Err(err),
        }
    }

    fn send_file(&mut self, file: &FileRef, offset: u64, len: u64) -> io::Result<SendOutcome> {
        let handle = file_handle(file)?;
        let want = usize::try_from(len).unwrap_or(usize::MAX).min(self.chunk);
        let mut scratch = vec![0u8; want];
        let read = read_at(handle, &mut scratch, offset)?;
        if read == 0 && want > 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("文件 `{}` 在偏移 {offset} 处提前结束", file.name()),
            ));
        }
        match self.inner.write(&scratch[..read]) {
            Ok(n) => {
                trace!(file = file.name(), offset, n, "stream send_file");
                Ok(SendOutcome::Accepted(n as u64))
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(SendOutcome::WouldBlock),
            Err(err) => Err(err),
        }
    }
}

/// 对文件引用自带的标准库句柄执行同步定位读。
#[derive(Clone, Copy, Debug, Default)]
pub struct StdFileIo;

impl FileIo for StdFileIo {
    fn read(
        &mut self,
        file: &FileRef,
        offset: u64,
        dst: &mut [u8],
        mode: ReadMode,
    ) -> io::Result<FileRead> {
        let handle = file_handle(file)?;
        let mut filled = 0;
        while filled < dst.len() {
            match read_at(handle, &mut dst[filled..], offset + filled as u64) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }
        trace!(file = file.name(), offset, filled, ?mode, "file read");
        Ok(FileRead::Ready(filled))
    }
}

/// 磁盘上的溢出文件。
pub struct FsTempFile {
    file: File,
    reader: FileRef,
    len: u64,
}

impl FsTempFile {
    /// 创建（或截断）`path` 作为溢出文件，`id` 为其在文件协作者中的编号。
    pub fn create(id: u64, path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        let reader = FileRef::from_std(id, path.display().to_string(), file.try_clone()?);
        Ok(Self {
            file,
            reader,
            len: 0,
        })
    }

    /// 已写入的字节数。
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn file(&self) -> &FileRef {
        &self.reader
    }
}

impl TempFileSink for FsTempFile {
    fn append(&mut self, data: &[u8]) -> io::Result<FileSpan> {
        self.file.write_all(data)?;
        let pos = self.len;
        self.len += data.len() as u64;
        Ok(FileSpan::new(self.reader.clone(), pos, self.len))
    }
}

fn file_handle(file: &FileRef) -> io::Result<&File> {
    file.handle().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::NotFound,
            format!("文件 `{}` 没有可用的系统句柄", file.name()),
        )
    })
}

#[cfg(unix)]
fn read_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    use std::os::unix::fs::FileExt;
    file.read_at(buf, offset)
}

#[cfg(windows)]
fn read_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    use std::os::windows::fs::FileExt;
    file.seek_read(buf, offset)
}

#[cfg(not(any(unix, windows)))]
fn read_at(_file: &File, _buf: &mut [u8], _offset: u64) -> io::Result<usize> {
    Err(io::Error::from(io::ErrorKind::Unsupported))
}

#[cfg(test)]
mod tests {
    use std::{
        env, fs,
        path::PathBuf,
        sync::atomic::{AtomicU32, Ordering},
    };

    use super::*;

    fn scratch_path(label: &str) -> PathBuf {
        static NEXT: AtomicU32 = AtomicU32::new(0);
        let n = NEXT.fetch_add(1, Ordering::Relaxed);
        env::temp_dir().join(format!("spark-output-{label}-{}-{n}", std::process::id()))
    }

    #[test]
    fn stream_transport_gathers_slices() {
        let mut transport = StreamTransport::new(Vec::new());
        let outcome = transport
            .send(&[IoSlice::new(b"he"), IoSlice::new(b"llo")])
            .expect("vec write");
        // `Vec<u8>` 的 `write_vectored` 会写满全部切片。
        assert_eq!(outcome, SendOutcome::Accepted(5));
        assert_eq!(transport.get_ref().as_slice(), b"hello");
    }

    #[test]
    fn temp_file_round_trips_through_std_file_io() {
        let path = scratch_path("spill");
        let mut sink = FsTempFile::create(9, &path).expect("create temp file");
        let first = sink.append(b"spilled ").expect("append");
        let second = sink.append(b"bytes").expect("append");
        assert_eq!((first.pos, first.last), (0, 8));
        assert_eq!((second.pos, second.last), (8, 13));
        assert!(second.file.same_file(sink.file()));

        let mut dst = [0u8; 5];
        let read = StdFileIo
            .read(&second.file, second.pos, &mut dst, ReadMode::Buffered)
            .expect("read back");
        assert_eq!(read, FileRead::Ready(5));
        assert_eq!(&dst, b"bytes");

        let mut transport = StreamTransport::new(Vec::new());
        let outcome = transport
            .send_file(&first.file, first.pos, first.len())
            .expect("send file");
        assert_eq!(outcome, SendOutcome::Accepted(8));
        assert_eq!(transport.into_inner(), b"spilled ");

        drop(sink);
        let _ = fs::remove_file(path);
    }

    #[test]
    fn missing_handle_is_reported() {
        let file = FileRef::new(1, "virtual");
        let err = StdFileIo
            .read(&file, 0, &mut [0u8; 4], ReadMode::Direct)
            .expect_err("no handle");
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }
}
