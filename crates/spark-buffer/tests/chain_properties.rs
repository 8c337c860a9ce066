//! 链表工具算法的性质测试。
//!
//! # 教案级注释概览
//! - **核心目标 (Why)**：以随机生成的链覆盖按发送量推进、忙链回收、文件区间合并三类算法的不变量，
//!   避免只在少数手写用例上成立；
//! - **设计手法 (How)**：每个缓冲用 `Piece` 描述（内存/文件/控制），在新池中实例化后执行算法并断言；
//! - **合同与边界 (What)**：生成的内存片段长度 0..32，文件片段 0..4096，控制标记混入其中。

use bytes::Bytes;
use proptest::prelude::*;
use spark_buffer::{
    BufFlags, BufId, BufTag, Chain, FileRef, Pool, chain_coalesce_file, chain_update_chains,
    chain_update_sent,
};

const TAG: BufTag = BufTag::new("prop");

#[derive(Clone, Debug)]
enum Piece {
    Memory(Vec<u8>),
    File { len: u64, gap: u64 },
    Flush,
}

fn piece() -> impl Strategy<Value = Piece> {
    prop_oneof![
        4 => proptest::collection::vec(any::<u8>(), 0..32).prop_map(Piece::Memory),
        3 => (0u64..4096, prop_oneof![3 => Just(0u64), 1 => 1u64..64])
            .prop_map(|(len, gap)| Piece::File { len, gap }),
        1 => Just(Piece::Flush),
    ]
}

fn build(pool: &mut Pool, pieces: &[Piece]) -> (Chain, Vec<BufId>) {
    let file = FileRef::new(1, "prop.bin");
    let mut offset = 0u64;
    let mut bufs = Vec::with_capacity(pieces.len());
    for piece in pieces {
        let buf = match piece {
            Piece::Memory(data) => pool.memory_buf(Bytes::from(data.clone())),
            Piece::File { len, gap } => {
                offset += gap;
                let buf = pool.file_buf(file.clone(), offset, offset + len);
                offset += len;
                buf
            }
            Piece::Flush => pool.control_buf(BufFlags {
                flush: true,
                ..BufFlags::default()
            }),
        };
        bufs.push(buf);
    }
    let chain = pool.chain_of(&bufs).expect("构建链失败");
    (chain, bufs)
}

proptest! {
    /// 推进 n 字节后，剩余总量恰好减少 n。
    #[test]
    fn update_sent_conserves_bytes(pieces in proptest::collection::vec(piece(), 0..12), frac in 0.0f64..=1.0) {
        let mut pool = Pool::new();
        let (chain, _) = build(&mut pool, &pieces);
        let total = chain.total_size(&pool);
        let sent = (total as f64 * frac) as u64;
        let head = chain_update_sent(&mut pool, chain.head(), sent);
        let rest = Chain::from_head(&pool, head);
        prop_assert_eq!(chain.total_size(&pool), total - sent);
        prop_assert_eq!(rest.total_size(&pool), total - sent);
    }

    /// 推进全部字节后返回 `None`，再次推进任意量仍为无操作。
    #[test]
    fn update_sent_full_drain_is_idempotent(pieces in proptest::collection::vec(piece(), 0..12), again in 0u64..100) {
        let mut pool = Pool::new();
        let (chain, _) = build(&mut pool, &pieces);
        let total = chain.total_size(&pool);
        prop_assert_eq!(chain_update_sent(&mut pool, chain.head(), total), None);
        prop_assert_eq!(chain.total_size(&pool), 0);
        prop_assert_eq!(chain_update_sent(&mut pool, chain.head(), again), None);
        prop_assert_eq!(chain.total_size(&pool), 0);
    }

    /// 文件区间合并只有在首缓冲单独超限时才会超过上限。
    #[test]
    fn coalesce_respects_limit(pieces in proptest::collection::vec(piece(), 1..12), limit in 0u64..8192) {
        let mut pool = Pool::new();
        let (chain, bufs) = build(&mut pool, &pieces);
        let mut cursor = chain.head();
        let merged = chain_coalesce_file(&pool, &mut cursor, limit);
        let first = pool.buf(bufs[0]).size();
        prop_assert!(merged <= limit || merged == first);
        if !pool.buf(bufs[0]).in_file() {
            prop_assert_eq!(merged, 0);
            prop_assert_eq!(cursor, chain.head());
        }
    }

    /// 忙链回收遵守 FIFO：第一个未发送完的节点之后不会有节点进入自由链表。
    #[test]
    fn update_chains_is_fifo(drained in proptest::collection::vec(any::<bool>(), 1..16)) {
        let mut pool = Pool::new();
        let mut bufs = Vec::new();
        for &done in &drained {
            let buf = pool.create_temp_buf(4).expect("分配失败");
            pool.append(buf, b"data").expect("写入失败");
            pool.buf_mut(buf).tag = Some(TAG);
            if done {
                pool.buf_mut(buf).drain();
            }
            bufs.push(buf);
        }
        let mut busy = pool.chain_of(&bufs).expect("忙链");
        let mut free = Chain::new();
        let mut out = Chain::new();
        chain_update_chains(&mut pool, &mut free, &mut busy, &mut out, TAG);

        let prefix = drained.iter().take_while(|&&done| done).count();
        prop_assert_eq!(free.len(&pool), prefix);
        prop_assert_eq!(busy.bufs(&pool).collect::<Vec<_>>(), bufs[prefix..].to_vec());
    }
}
