//! `chain_contract` 集成测试：从外部 crate 视角验证链表工具算法的契约。
//!
//! # 测试目标（Why）
//! - `chain_update_chains` 只回收本标签、且按 FIFO 顺序回收；
//! - 别名缓冲在不同所有者之间不会被提前复位；
//! - 追加拷贝与按发送量推进组合后，数据顺序保持不变。

use bytes::Bytes;
use spark_buffer::{
    BufId, BufTag, Chain, FileRef, Pool, chain_add_copy, chain_coalesce_file,
    chain_update_chains, chain_update_sent,
};

const OWNER_A: BufTag = BufTag::new("owner-a");
const OWNER_B: BufTag = BufTag::new("owner-b");

fn tagged_temp(pool: &mut Pool, data: &[u8], tag: BufTag) -> BufId {
    let buf = pool.create_temp_buf(data.len().max(1)).expect("分配失败");
    pool.append(buf, data).expect("写入失败");
    pool.buf_mut(buf).tag = Some(tag);
    buf
}

fn drain_bytes(pool: &mut Pool, chain: &Chain) -> Vec<u8> {
    let mut out = Vec::new();
    for buf in chain.bufs(pool).collect::<Vec<_>>() {
        out.extend_from_slice(pool.memory(buf));
    }
    let total = chain.total_size(pool);
    assert_eq!(chain_update_sent(pool, chain.head(), total), None);
    out
}

/// 两个上下文别名同一缓冲，缓冲属于 B：A 的回收不得复位它，B 随后可以正常回收。
#[test]
fn aliased_buffer_is_recycled_only_by_its_owner() {
    let mut pool = Pool::new();
    let shared = tagged_temp(&mut pool, b"shared", OWNER_B);

    let mut busy_b = pool.chain_of(&[shared]).expect("B 的忙链");
    let mut busy_a = Chain::new();
    chain_add_copy(&mut pool, &mut busy_a, &busy_b).expect("A 拷贝节点");

    // 传输层把这段数据完整发送出去。
    assert_eq!(chain_update_sent(&mut pool, busy_a.head(), 6), None);

    let (mut free_a, mut out_a) = (Chain::new(), Chain::new());
    chain_update_chains(&mut pool, &mut free_a, &mut busy_a, &mut out_a, OWNER_A);
    assert!(free_a.is_empty(), "A 不拥有该缓冲，不能回收");
    assert_eq!(busy_a.len(&pool), 1);
    let span = pool.buf(shared).mem_span().copied().expect("内存区间");
    assert_eq!(span.pos, span.last);
    assert_ne!(span.pos, span.start, "缓冲未被复位");

    let (mut free_b, mut out_b) = (Chain::new(), Chain::new());
    chain_update_chains(&mut pool, &mut free_b, &mut busy_b, &mut out_b, OWNER_B);
    assert_eq!(free_b.bufs(&pool).collect::<Vec<_>>(), vec![shared]);
    assert!(busy_b.is_empty());
    let span = pool.buf(shared).mem_span().copied().expect("内存区间");
    assert_eq!((span.pos, span.last), (span.start, span.start));
}

/// 忙链头部未发送完时，即便后续节点已空也不得回收。
#[test]
fn update_chains_stops_at_first_pending_node() {
    let mut pool = Pool::new();
    let first = tagged_temp(&mut pool, b"pending", OWNER_A);
    let second = tagged_temp(&mut pool, b"done", OWNER_A);
    let mut busy = pool.chain_of(&[first, second]).expect("忙链");
    pool.buf_mut(second).drain();

    let mut free = Chain::new();
    let mut out = Chain::new();
    chain_update_chains(&mut pool, &mut free, &mut busy, &mut out, OWNER_A);
    assert!(free.is_empty());
    assert_eq!(busy.bufs(&pool).collect::<Vec<_>>(), vec![first, second]);
}

/// `out` 在回收扫描之后拼接到忙链尾部，并被清空。
#[test]
fn update_chains_moves_out_to_busy_tail() {
    let mut pool = Pool::new();
    let sent = tagged_temp(&mut pool, b"sent", OWNER_A);
    let fresh = tagged_temp(&mut pool, b"fresh", OWNER_A);
    let mut busy = pool.chain_of(&[sent]).expect("忙链");
    let mut out = pool.chain_of(&[fresh]).expect("输出链");
    pool.buf_mut(sent).drain();

    let mut free = Chain::new();
    chain_update_chains(&mut pool, &mut free, &mut busy, &mut out, OWNER_A);
    assert!(out.is_empty());
    assert_eq!(free.bufs(&pool).collect::<Vec<_>>(), vec![sent]);
    assert_eq!(busy.bufs(&pool).collect::<Vec<_>>(), vec![fresh]);
}

/// 先追加 A 再追加 B，完整排空后字节顺序为 A 后接 B。
#[test]
fn add_copy_preserves_append_order() {
    let mut pool = Pool::new();
    let parts_a = [Bytes::from_static(b"GET "), Bytes::from_static(b"/index")];
    let parts_b = [Bytes::from_static(b".html")];
    let bufs_a: Vec<_> = parts_a.iter().cloned().map(|p| pool.memory_buf(p)).collect();
    let bufs_b: Vec<_> = parts_b.iter().cloned().map(|p| pool.memory_buf(p)).collect();
    let chain_a = pool.chain_of(&bufs_a).expect("链 A");
    let chain_b = pool.chain_of(&bufs_b).expect("链 B");

    let mut pending = Chain::new();
    chain_add_copy(&mut pool, &mut pending, &chain_a).expect("追加 A");
    chain_add_copy(&mut pool, &mut pending, &chain_b).expect("追加 B");
    assert_eq!(drain_bytes(&mut pool, &pending), b"GET /index.html");
}

/// 文件区间合并遇到间隙即停止，游标指向间隙后的节点。
#[test]
fn coalesce_stops_at_gap() {
    let mut pool = Pool::new();
    let file = FileRef::new(3, "static.bin");
    let bufs = [
        pool.file_buf(file.clone(), 0, 10),
        pool.file_buf(file.clone(), 10, 20),
        pool.file_buf(file, 30, 40),
    ];
    let chain = pool.chain_of(&bufs).expect("文件链");
    let mut cursor = chain.head();
    assert_eq!(chain_coalesce_file(&pool, &mut cursor, 1_000), 20);
    assert_eq!(cursor.map(|link| pool.link_buf(link)), Some(bufs[2]));

    let mut cursor = chain.head();
    assert_eq!(chain_coalesce_file(&pool, &mut cursor, 15), 10, "不得越过上限");
}
