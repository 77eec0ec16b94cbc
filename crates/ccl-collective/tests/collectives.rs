// Multi-rank scenarios. Every rank of a group lives in this test process;
// they talk over the in-process `mem` provider unless a test says otherwise.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;

use ccl_collective::{GroupState, ProcessGroup, RequestStatus};
use ccl_net::{MemFabric, RendezvousServer, TransportRegistry};
use ccl_types::{
    Buffer, CclError, CollectiveOutput, CollectiveRequest, DataType, EnvConfig, GroupOptions,
    ReduceOp,
};

// ── Harness ──────────────────────────────────────────────────────────────────

fn env() -> EnvConfig {
    EnvConfig::from_lookup(Path::new("/opt/ccl"), |_| None)
}

fn options(addr: &str, world_size: u32, rank: u32, transport: &str) -> GroupOptions {
    let mut opts = GroupOptions::new(addr, world_size, rank).with_transport(transport);
    opts.host_coordinator = false;
    opts.rendezvous_timeout = Duration::from_secs(20);
    opts.connect_timeout = Duration::from_secs(10);
    opts.op_timeout = Duration::from_secs(20);
    opts
}

/// Form an `n`-rank group with a standalone coordinator.
async fn form_with(
    n: u32,
    transport: &str,
    registry: Arc<TransportRegistry>,
    tune: impl Fn(&mut GroupOptions),
) -> Vec<ProcessGroup> {
    let server = RendezvousServer::bind("127.0.0.1:0", n).await.unwrap();
    let addr = server.local_addr().unwrap().to_string();
    let coordinator = server.spawn_once(Duration::from_secs(20));
    let env = env();

    let creating = (0..n).map(|rank| {
        let mut opts = options(&addr, n, rank, transport);
        tune(&mut opts);
        let registry = registry.clone();
        let env = env.clone();
        async move { ProcessGroup::create(opts, &env, &registry).await }
    });
    let groups: Vec<ProcessGroup> = join_all(creating)
        .await
        .into_iter()
        .map(|g| g.unwrap())
        .collect();
    coordinator.await.unwrap().unwrap();
    groups
}

async fn form(n: u32) -> Vec<ProcessGroup> {
    form_with(n, "mem", Arc::new(TransportRegistry::with_fabric(MemFabric::new())), |_| {}).await
}

async fn destroy_all(groups: &[ProcessGroup]) {
    for g in groups {
        g.destroy().await.unwrap();
    }
}

// ── Broadcast ────────────────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn broadcast_from_every_root() {
    let groups = form(4).await;

    for root in 0..4u32 {
        let expected: Vec<i32> = (0..5).map(|i| (root * 100) as i32 + i).collect();
        let results = join_all(groups.iter().map(|pg| {
            let buffer = if pg.rank() == root {
                Buffer::from_i32(&expected)
            } else {
                Buffer::zeros(DataType::I32, 5)
            };
            pg.broadcast(root, buffer)
        }))
        .await;

        for (rank, res) in results.into_iter().enumerate() {
            assert_eq!(res.unwrap().to_i32().unwrap(), expected, "root {root} rank {rank}");
        }
    }
    destroy_all(&groups).await;
}

// ── Reduce ───────────────────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn reduce_sums_to_root_only() {
    let groups = form(4).await;

    // Inputs [1], [2], [3], [4] summed onto rank 0.
    let results = join_all(groups.iter().map(|pg| {
        pg.reduce(
            0,
            ReduceOp::Sum,
            Buffer::from_i64(&[pg.rank() as i64 + 1]),
            Buffer::from_i64(&[-1]),
        )
    }))
    .await;

    let outputs: Vec<Vec<i64>> = results.into_iter().map(|r| r.unwrap().to_i64().unwrap()).collect();
    assert_eq!(outputs[0], vec![10]);
    for out in &outputs[1..] {
        assert_eq!(out, &vec![-1], "non-root output must be untouched");
    }
    destroy_all(&groups).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn reduce_max_to_non_zero_root() {
    let groups = form(3).await;
    let results = join_all(groups.iter().map(|pg| {
        let r = pg.rank() as f32;
        pg.reduce(
            2,
            ReduceOp::Max,
            Buffer::from_f32(&[r, -r, 1.0]),
            Buffer::zeros(DataType::F32, 3),
        )
    }))
    .await;
    let outputs: Vec<_> = results.into_iter().map(|r| r.unwrap()).collect();
    assert_eq!(outputs[2].to_f32().unwrap(), vec![2.0, 0.0, 1.0]);
    destroy_all(&groups).await;
}

// ── All-reduce ───────────────────────────────────────────────────────────────

async fn all_reduce_everywhere(groups: &[ProcessGroup], op: ReduceOp, make: impl Fn(u32) -> Buffer) -> Vec<Buffer> {
    join_all(groups.iter().map(|pg| {
        let input = make(pg.rank());
        let output = Buffer::zeros(input.dtype(), input.count());
        pg.all_reduce(op, input, output)
    }))
    .await
    .into_iter()
    .map(|r| r.unwrap())
    .collect()
}

fn noisy_f32(rank: u32, count: usize) -> Buffer {
    let values: Vec<f32> = (0..count)
        .map(|i| ((i as f32) * 0.37 + rank as f32 * 1.3).sin() * 1e3 + 1e-3 * i as f32)
        .collect();
    Buffer::from_f32(&values)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn all_reduce_tree_and_ring_are_exact_for_integers() {
    let groups = form(4).await;

    // 3 elements: tree. 10_000 i64 = 80 KB: ring.
    for count in [3usize, 10_000] {
        let outputs = all_reduce_everywhere(&groups, ReduceOp::Sum, |r| {
            let values: Vec<i64> = (0..count as i64).map(|i| i * (r as i64 + 1)).collect();
            Buffer::from_i64(&values)
        })
        .await;

        let expected: Vec<i64> = (0..count as i64).map(|i| i * 10).collect();
        for out in outputs {
            assert_eq!(out.to_i64().unwrap(), expected, "count {count}");
        }
    }
    destroy_all(&groups).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn all_reduce_results_are_bitwise_identical_on_every_rank() {
    let groups = form(4).await;

    // Below and above the 64 KiB crossover.
    for count in [100usize, 20_000] {
        let outputs = all_reduce_everywhere(&groups, ReduceOp::Sum, |r| noisy_f32(r, count)).await;
        for out in &outputs[1..] {
            assert_eq!(out.as_bytes(), outputs[0].as_bytes(), "count {count}");
        }

        // And close to the mathematically exact sum.
        let got = outputs[0].to_f32().unwrap();
        for (i, v) in got.iter().enumerate().step_by(997) {
            let exact: f64 = (0..4)
                .map(|r| noisy_f32(r, count).to_f32().unwrap()[i] as f64)
                .sum();
            assert!((*v as f64 - exact).abs() < 1e-2, "element {i}: {v} vs {exact}");
        }
    }
    destroy_all(&groups).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn all_reduce_is_deterministic_across_fresh_groups() {
    let mut runs = Vec::new();
    for _ in 0..2 {
        let groups = form(3).await;
        let outputs = all_reduce_everywhere(&groups, ReduceOp::Sum, |r| noisy_f32(r, 30_000)).await;
        runs.push(outputs[0].as_bytes().to_vec());
        destroy_all(&groups).await;
    }
    assert_eq!(runs[0], runs[1]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn ring_handles_fewer_elements_than_ranks() {
    let registry = Arc::new(TransportRegistry::with_fabric(MemFabric::new()));
    let groups = form_with(4, "mem", registry, |o| o.ring_threshold_bytes = 0).await;

    let outputs = all_reduce_everywhere(&groups, ReduceOp::Product, |r| {
        Buffer::from_i32(&[r as i32 + 1, 2])
    })
    .await;
    for out in outputs {
        assert_eq!(out.to_i32().unwrap(), vec![24, 16]);
    }
    destroy_all(&groups).await;
}

// ── All-gather ───────────────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn all_gather_collects_rank_indices() {
    let groups = form(3).await;
    let results = join_all(groups.iter().map(|pg| {
        pg.all_gather(
            Buffer::from_i32(&[pg.rank() as i32]),
            (0..3).map(|_| Buffer::zeros(DataType::I32, 1)).collect(),
        )
    }))
    .await;

    for res in results {
        let gathered: Vec<i32> = res.unwrap().iter().map(|b| b.to_i32().unwrap()[0]).collect();
        assert_eq!(gathered, vec![0, 1, 2]);
    }
    destroy_all(&groups).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn all_gather_with_uneven_counts() {
    let groups = form(4).await;
    // Rank r contributes r + 1 copies of r.
    let results = join_all(groups.iter().map(|pg| {
        let r = pg.rank();
        pg.all_gather(
            Buffer::from_u8(&vec![r as u8; r as usize + 1]),
            (0..4).map(|i| Buffer::zeros(DataType::U8, i + 1)).collect(),
        )
    }))
    .await;

    for res in results {
        let outputs = res.unwrap();
        for (i, out) in outputs.iter().enumerate() {
            assert_eq!(out.to_u8().unwrap(), vec![i as u8; i + 1]);
        }
    }
    destroy_all(&groups).await;
}

// ── Gather / scatter / all-to-all ────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn gather_uneven_contributions_onto_root() {
    let groups = form(4).await;
    // Rank r contributes r + 1 copies of r * 10, gathered on rank 1.
    let results = join_all(groups.iter().map(|pg| {
        let r = pg.rank();
        let outputs = if r == 1 {
            (0..4).map(|i| Buffer::zeros(DataType::I32, i + 1)).collect()
        } else {
            Vec::new()
        };
        pg.gather(1, Buffer::from_i32(&vec![r as i32 * 10; r as usize + 1]), outputs)
    }))
    .await;

    for (rank, res) in results.into_iter().enumerate() {
        let outputs = res.unwrap();
        if rank != 1 {
            assert!(outputs.is_empty(), "rank {rank}");
            continue;
        }
        for (i, out) in outputs.iter().enumerate() {
            assert_eq!(out.to_i32().unwrap(), vec![i as i32 * 10; i + 1]);
        }
    }
    destroy_all(&groups).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn scatter_hands_each_rank_its_piece() {
    let groups = form(3).await;
    let pieces: Vec<Vec<f64>> = (0..3).map(|i| vec![i as f64 + 0.5; 2 * i + 1]).collect();

    let results = join_all(groups.iter().map(|pg| {
        let r = pg.rank() as usize;
        let inputs = if r == 2 {
            pieces.iter().map(|p| Buffer::from_f64(p)).collect()
        } else {
            Vec::new()
        };
        pg.scatter(2, inputs, Buffer::zeros(DataType::F64, 2 * r + 1))
    }))
    .await;

    for (rank, res) in results.into_iter().enumerate() {
        assert_eq!(res.unwrap().to_f64().unwrap(), pieces[rank], "rank {rank}");
    }
    destroy_all(&groups).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn all_to_all_transposes_uneven_slots() {
    let groups = form(4).await;
    // Rank r sends j + 1 copies of r * 10 + j to rank j, so it receives
    // r + 1 values from every rank.
    let results = join_all(groups.iter().map(|pg| {
        let r = pg.rank() as i64;
        let inputs = (0..4).map(|j| Buffer::from_i64(&vec![r * 10 + j; j as usize + 1])).collect();
        let outputs = (0..4).map(|_| Buffer::zeros(DataType::I64, r as usize + 1)).collect();
        pg.all_to_all(inputs, outputs)
    }))
    .await;

    for (rank, res) in results.into_iter().enumerate() {
        for (j, out) in res.unwrap().iter().enumerate() {
            assert_eq!(out.to_i64().unwrap(), vec![j as i64 * 10 + rank as i64; rank + 1]);
        }
    }
    destroy_all(&groups).await;
}

// ── Frame limits ─────────────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn payloads_larger_than_a_frame_are_split() {
    let registry = Arc::new(TransportRegistry::with_fabric(MemFabric::new()));
    let groups = form_with(3, "mem", registry, |o| o.max_frame_bytes = 4096).await;

    // 20_000 bytes from root 1: five frames per hop.
    let expected: Vec<u8> = (0..20_000u32).map(|i| (i % 251) as u8).collect();
    let results = join_all(groups.iter().map(|pg| {
        let buffer = if pg.rank() == 1 {
            Buffer::from_u8(&expected)
        } else {
            Buffer::zeros(DataType::U8, expected.len())
        };
        pg.broadcast(1, buffer)
    }))
    .await;
    for (rank, res) in results.into_iter().enumerate() {
        assert_eq!(res.unwrap().to_u8().unwrap(), expected, "rank {rank}");
    }

    // 80 KB of i64 takes the ring; each segment spans several frames.
    let outputs = all_reduce_everywhere(&groups, ReduceOp::Sum, |r| {
        Buffer::from_i64(&(0..10_000i64).map(|i| i + r as i64).collect::<Vec<_>>())
    })
    .await;
    let sums: Vec<i64> = (0..10_000i64).map(|i| 3 * i + 3).collect();
    for out in outputs {
        assert_eq!(out.to_i64().unwrap(), sums);
    }

    // Uneven all-gather slots, some empty, some spanning frames.
    let results = join_all(groups.iter().map(|pg| {
        let len = [0usize, 9000, 10][pg.rank() as usize];
        pg.all_gather(
            Buffer::from_u8(&vec![pg.rank() as u8 + 1; len]),
            [0usize, 9000, 10].iter().map(|&n| Buffer::zeros(DataType::U8, n)).collect(),
        )
    }))
    .await;
    for res in results {
        let outputs = res.unwrap();
        assert!(outputs[0].to_u8().unwrap().is_empty());
        assert_eq!(outputs[1].to_u8().unwrap(), vec![2u8; 9000]);
        assert_eq!(outputs[2].to_u8().unwrap(), vec![3u8; 10]);
    }

    for pg in &groups {
        assert_eq!(pg.state(), GroupState::Active);
    }
    destroy_all(&groups).await;
}

// ── Barrier / async submission ───────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn barrier_and_async_handles() {
    let groups = form(3).await;

    let handles = join_all(groups.iter().map(|pg| async move {
        let mut handles = Vec::new();
        for v in 0..3i64 {
            handles.push(
                pg.submit_async(CollectiveRequest::AllReduce {
                    op: ReduceOp::Sum,
                    input: Buffer::from_i64(&[v]),
                    output: Buffer::zeros(DataType::I64, 1),
                })
                .await
                .unwrap(),
            );
        }
        handles.push(pg.submit_async(CollectiveRequest::Barrier).await.unwrap());
        handles
    }))
    .await;

    for rank_handles in handles {
        for (v, handle) in rank_handles.into_iter().enumerate() {
            match handle.wait().await.unwrap() {
                CollectiveOutput::AllReduce { output, .. } => {
                    assert_eq!(output.to_i64().unwrap(), vec![3 * v as i64]);
                }
                CollectiveOutput::Barrier => assert_eq!(v, 3),
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    // A handle submitted after everything above completes on its own.
    let last = join_all(groups.iter().map(|pg| async move {
        let handle = pg.submit_async(CollectiveRequest::Barrier).await.unwrap();
        let kind = handle.kind();
        (kind, handle.wait().await)
    }))
    .await;
    for (_, res) in last {
        assert!(matches!(res, Ok(CollectiveOutput::Barrier)));
    }

    for pg in &groups {
        assert_eq!(pg.state(), GroupState::Active);
    }
    destroy_all(&groups).await;
}

// ── Failures ─────────────────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn severed_rank_is_reported_by_every_survivor() {
    let groups = form(4).await;
    groups[2].destroy().await.unwrap();

    let survivors = [0usize, 1, 3];
    let results = join_all(survivors.iter().map(|&r| {
        groups[r].all_reduce(ReduceOp::Sum, Buffer::from_f32(&[1.0]), Buffer::zeros(DataType::F32, 1))
    }))
    .await;

    for (&rank, res) in survivors.iter().zip(results) {
        match res {
            Err(CclError::Collective { failed_peer, .. }) => {
                assert_eq!(failed_peer, Some(2), "rank {rank}");
            }
            other => panic!("rank {rank}: unexpected {other:?}"),
        }
        assert_eq!(groups[rank].state(), GroupState::Faulted);
        assert_eq!(groups[rank].fault().unwrap().failed_peer, Some(2));
    }

    // Faulted groups fail fast and can still be destroyed.
    let again = groups[0].barrier().await;
    assert!(matches!(again, Err(CclError::Collective { failed_peer: Some(2), .. })));
    for &r in &survivors {
        groups[r].destroy().await.unwrap();
        assert_eq!(groups[r].state(), GroupState::Destroyed);
    }
}

fn assert_blames(rank: usize, res: ccl_types::Result<Buffer>, peer: u32) {
    match res {
        Err(CclError::Collective { failed_peer, .. }) => {
            assert_eq!(failed_peer, Some(peer), "rank {rank}");
        }
        other => panic!("rank {rank}: unexpected {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn silent_rank_is_blamed_by_every_survivor() {
    // Ring, then tree. Rank 2 stays connected but never submits.
    for ring_threshold_bytes in [0usize, usize::MAX] {
        let registry = Arc::new(TransportRegistry::with_fabric(MemFabric::new()));
        let groups = form_with(4, "mem", registry, |o| {
            o.op_timeout = Duration::from_secs(1);
            o.ring_threshold_bytes = ring_threshold_bytes;
        })
        .await;

        let survivors = [0usize, 1, 3];
        let started = Instant::now();
        let results = join_all(survivors.iter().map(|&r| {
            groups[r].all_reduce(ReduceOp::Sum, Buffer::from_i32(&[1; 64]), Buffer::zeros(DataType::I32, 64))
        }))
        .await;

        for (&rank, res) in survivors.iter().zip(results) {
            assert_blames(rank, res, 2);
            assert_eq!(groups[rank].fault().unwrap().failed_peer, Some(2));
        }
        assert!(started.elapsed() < Duration::from_secs(10));
        destroy_all(&groups).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn rank_dropped_mid_collective_is_blamed_quickly() {
    let registry = Arc::new(TransportRegistry::with_fabric(MemFabric::new()));
    let mut groups = form_with(4, "mem", registry, |o| o.ring_threshold_bytes = 0).await;
    let severed = groups.remove(2);

    // Survivors are now ranks 0, 1 and 3, blocked in the ring on rank 2.
    let started = Instant::now();
    let running = join_all(groups.iter().map(|pg| {
        pg.all_reduce(ReduceOp::Sum, Buffer::from_f32(&[1.0; 256]), Buffer::zeros(DataType::F32, 256))
    }));
    let dropping = async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        // No destroy, so no goodbye: the links just go away.
        drop(severed);
    };
    let (results, ()) = tokio::join!(running, dropping);

    for (pg, res) in groups.iter().zip(results) {
        assert_blames(pg.rank() as usize, res, 2);
    }
    // Far sooner than the 20 s receive timeout.
    assert!(started.elapsed() < Duration::from_secs(5));
    destroy_all(&groups).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn mismatched_collective_is_detected() {
    let registry = Arc::new(TransportRegistry::with_fabric(MemFabric::new()));
    let groups = form_with(2, "mem", registry, |o| {
        o.verify_signatures = true;
        o.op_timeout = Duration::from_secs(5);
    })
    .await;

    let (bcast, reduce) = tokio::join!(
        groups[0].broadcast(0, Buffer::from_i32(&[1, 2, 3, 4])),
        groups[1].all_reduce(ReduceOp::Sum, Buffer::from_i32(&[1, 2, 3, 4]), Buffer::zeros(DataType::I32, 4)),
    );
    // Rank 0's broadcast only sends, so it may complete.
    drop(bcast);
    match reduce {
        Err(CclError::MismatchedCollective { peer, expected, actual }) => {
            assert_eq!(peer, 0);
            assert!(expected.starts_with("all_reduce"));
            assert!(actual.starts_with("broadcast"));
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(groups[1].state(), GroupState::Faulted);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancelling_a_request_faults_the_group() {
    let groups = form(2).await;

    // Only rank 0 submits, so the barrier cannot complete.
    let handle = groups[0].submit_async(CollectiveRequest::Barrier).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(handle.query(), RequestStatus::Running);
    handle.cancel();

    assert!(matches!(groups[0].state(), GroupState::Faulted));
    // Unblock rank 1's view too: its peer aborted.
    let res = groups[1].barrier().await;
    assert!(res.is_err());
    destroy_all(&groups).await;
}

// ── Transports ───────────────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn tcp_group_all_reduce() {
    let groups = form_with(3, "tcp", Arc::new(TransportRegistry::with_builtins()), |_| {}).await;
    assert!(groups.iter().all(|g| g.transport() == "tcp"));

    let outputs = all_reduce_everywhere(&groups, ReduceOp::Sum, |r| Buffer::from_i32(&[r as i32; 20_000])).await;
    for out in outputs {
        assert!(out.to_i32().unwrap().iter().all(|v| *v == 3));
    }
    destroy_all(&groups).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn rank_zero_hosts_the_coordinator() {
    let port = {
        let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        l.local_addr().unwrap().port()
    };
    let addr = format!("127.0.0.1:{port}");
    let registry = Arc::new(TransportRegistry::with_builtins());
    let env = env();

    let creating = (0..2u32).map(|rank| {
        let mut opts = options(&addr, 2, rank, "tcp");
        opts.host_coordinator = true;
        let registry = registry.clone();
        let env = env.clone();
        async move { ProcessGroup::create(opts, &env, &registry).await }
    });
    let groups: Vec<_> = join_all(creating).await.into_iter().map(|g| g.unwrap()).collect();
    assert_eq!(groups[0].group_id(), groups[1].group_id());
    assert_eq!(groups[1].directory().world_size(), 2);

    join_all(groups.iter().map(|g| g.barrier())).await.into_iter().for_each(|r| r.unwrap());
    destroy_all(&groups).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unavailable_transport_forms_group_but_fails_collectives() {
    let groups = form_with(2, "tcp", Arc::new(TransportRegistry::empty()), |_| {}).await;
    assert_eq!(groups[0].transport(), "unavailable");

    let err = groups[0].barrier().await.unwrap_err();
    assert!(matches!(err, CclError::Transport { .. }));
    destroy_all(&groups).await;
}

#[tokio::test]
async fn single_rank_group_never_touches_a_transport() {
    let env = env();
    let pg = ProcessGroup::create(GroupOptions::default(), &env, &TransportRegistry::empty())
        .await
        .unwrap();
    let out = pg
        .all_gather(Buffer::from_i32(&[5, 6]), vec![Buffer::zeros(DataType::I32, 2)])
        .await
        .unwrap();
    assert_eq!(out[0].to_i32().unwrap(), vec![5, 6]);
    pg.destroy().await.unwrap();
}
