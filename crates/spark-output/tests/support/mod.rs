//! 集成测试共享的协作者替身。

#![allow(dead_code)]

use std::{
    collections::{HashMap, VecDeque},
    io::{self, IoSlice},
};

use spark_buffer::{BufId, Chain, FileRef, FileSpan, Pool, chain_update_sent};
use spark_output::{
    FileIo, FileRead, FilterStatus, OutputError, OutputFilter, ReadMode, SendOutcome,
    TempFileSink, Transport,
};

/// 文件内容按编号登记在内存中。
#[derive(Default)]
pub struct Files {
    contents: HashMap<u64, Vec<u8>>,
}

impl Files {
    pub fn insert(&mut self, id: u64, data: Vec<u8>) {
        self.contents.insert(id, data);
    }

    pub fn slice(&self, id: u64, offset: u64, len: u64) -> io::Result<&[u8]> {
        let data = self
            .contents
            .get(&id)
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotFound))?;
        let start = offset as usize;
        let end = start + len as usize;
        data.get(start..end)
            .ok_or_else(|| io::Error::from(io::ErrorKind::UnexpectedEof))
    }
}

/// 预先编排的一次传输层回答。
#[derive(Debug)]
pub enum Scripted {
    WouldBlock,
    Offload,
    Fail(io::ErrorKind),
}

/// 记录线上字节的传输层替身。
///
/// - `per_call`：每次最多接受的字节数；
/// - `script`：优先于正常发送消耗的预设回答。
pub struct MockTransport {
    pub wire: Vec<u8>,
    pub files: Files,
    pub per_call: usize,
    pub script: VecDeque<Scripted>,
    pub iov_counts: Vec<usize>,
    pub file_sends: Vec<(u64, u64, u64)>,
    offload: Option<(u64, u64, u64)>,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self {
            wire: Vec::new(),
            files: Files::default(),
            per_call: usize::MAX,
            script: VecDeque::new(),
            iov_counts: Vec::new(),
            file_sends: Vec::new(),
            offload: None,
        }
    }
}

impl MockTransport {
    pub fn with_per_call(per_call: usize) -> Self {
        Self {
            per_call,
            ..Self::default()
        }
    }

    /// 模拟后台线程完成文件发送，返回发送的字节数。
    pub fn finish_offload(&mut self) -> u64 {
        let Some((id, offset, len)) = self.offload.take() else {
            return 0;
        };
        let bytes = self.files.slice(id, offset, len).expect("offloaded range").to_vec();
        self.wire.extend_from_slice(&bytes);
        len
    }

    fn scripted(&mut self) -> Option<io::Result<SendOutcome>> {
        Some(match self.script.pop_front()? {
            Scripted::WouldBlock => Ok(SendOutcome::WouldBlock),
            Scripted::Offload => Ok(SendOutcome::Offloaded),
            Scripted::Fail(kind) => Err(io::Error::from(kind)),
        })
    }
}

impl Transport for MockTransport {
    fn send(&mut self, bufs: &[IoSlice<'_>]) -> io::Result<SendOutcome> {
        if let Some(answer) = self.scripted() {
            return answer;
        }
        self.iov_counts.push(bufs.len());
        let mut left = self.per_call;
        let mut accepted = 0u64;
        for slice in bufs {
            let take = left.min(slice.len());
            self.wire.extend_from_slice(&slice[..take]);
            left -= take;
            accepted += take as u64;
            if left == 0 {
                break;
            }
        }
        Ok(SendOutcome::Accepted(accepted))
    }

    fn send_file(&mut self, file: &FileRef, offset: u64, len: u64) -> io::Result<SendOutcome> {
        match self.scripted() {
            Some(Ok(SendOutcome::Offloaded)) => {
                self.offload = Some((file.id(), offset, len));
                return Ok(SendOutcome::Offloaded);
            }
            Some(answer) => return answer,
            None => {}
        }
        self.file_sends.push((file.id(), offset, len));
        let len = len.min(self.per_call as u64);
        let bytes = self.files.slice(file.id(), offset, len)?.to_vec();
        self.wire.extend_from_slice(&bytes);
        Ok(SendOutcome::Accepted(len))
    }
}

/// 文件协作者替身：可预设若干次 `Pending` 回答，并记录每次读取。
#[derive(Default)]
pub struct MockFileIo {
    pub files: Files,
    pub pending: usize,
    pub reads: Vec<(u64, u64, usize, ReadMode)>,
    pub misaligned_direct: usize,
    pub alignment: usize,
}

impl FileIo for MockFileIo {
    fn read(
        &mut self,
        file: &FileRef,
        offset: u64,
        dst: &mut [u8],
        mode: ReadMode,
    ) -> io::Result<FileRead> {
        if self.pending > 0 {
            self.pending -= 1;
            return Ok(FileRead::Pending);
        }
        if mode == ReadMode::Direct
            && self.alignment > 0
            && (dst.as_ptr() as usize % self.alignment != 0
                || offset % self.alignment as u64 != 0)
        {
            self.misaligned_direct += 1;
        }
        self.reads.push((file.id(), offset, dst.len(), mode));
        let src = self.files.slice(file.id(), offset, dst.len() as u64)?;
        dst.copy_from_slice(src);
        Ok(FileRead::Ready(dst.len()))
    }
}

/// 溢出目标替身：内容写入内存中的“临时文件”，与 [`MockTransport::files`] 共享编号。
pub struct MemorySink {
    pub file: FileRef,
    pub data: std::rc::Rc<std::cell::RefCell<Vec<u8>>>,
}

impl TempFileSink for MemorySink {
    fn append(&mut self, data: &[u8]) -> io::Result<FileSpan> {
        let mut stored = self.data.borrow_mut();
        let pos = stored.len() as u64;
        stored.extend_from_slice(data);
        Ok(FileSpan::new(self.file.clone(), pos, stored.len() as u64))
    }
}

/// 一次下游调用看到的缓冲摘要。
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Seen {
    Memory(Vec<u8>),
    File { id: u64, pos: u64, last: u64, temp: bool },
    Control,
}

/// 记录每次调用内容的下游替身。
///
/// `drain == true` 时立即把收到的缓冲标记为已消费，模拟同步写完的下游；
/// 否则缓冲保持未消费，由测试自行决定何时排空。
pub struct Recorder {
    pub calls: Vec<Vec<Seen>>,
    pub bufs: Vec<BufId>,
    pub heads: Vec<Option<spark_buffer::LinkId>>,
    pub drain: bool,
    pub last_buf_seen: bool,
}

impl Recorder {
    pub fn draining() -> Self {
        Self {
            calls: Vec::new(),
            bufs: Vec::new(),
            heads: Vec::new(),
            drain: true,
            last_buf_seen: false,
        }
    }

    pub fn holding() -> Self {
        Self {
            drain: false,
            ..Self::draining()
        }
    }

    /// 所有调用中内存缓冲内容的拼接。
    pub fn memory_bytes(&self) -> Vec<u8> {
        self.calls
            .iter()
            .flatten()
            .filter_map(|seen| match seen {
                Seen::Memory(bytes) => Some(bytes.as_slice()),
                _ => None,
            })
            .flatten()
            .copied()
            .collect()
    }

    /// 非空调用的次数。
    pub fn non_empty_calls(&self) -> usize {
        self.calls.iter().filter(|call| !call.is_empty()).count()
    }
}

impl OutputFilter for Recorder {
    fn output(&mut self, pool: &mut Pool, chain: &Chain) -> Result<FilterStatus, OutputError> {
        self.heads.push(chain.head());
        let mut call = Vec::new();
        for buf_id in chain.bufs(pool).collect::<Vec<_>>() {
            let buf = pool.buf(buf_id);
            self.last_buf_seen |= buf.flags.last_buf;
            let seen = if let Some(span) = buf.file_span() {
                Seen::File {
                    id: span.file.id(),
                    pos: span.pos,
                    last: span.last,
                    temp: buf.flags.temp_file,
                }
            } else if buf.in_memory() {
                Seen::Memory(pool.memory(buf_id).to_vec())
            } else {
                Seen::Control
            };
            call.push(seen);
            self.bufs.push(buf_id);
        }
        self.calls.push(call);
        if self.drain {
            let total = chain.total_size(pool);
            chain_update_sent(pool, chain.head(), total);
            Ok(FilterStatus::Done)
        } else {
            Ok(FilterStatus::Again)
        }
    }
}
