mod common;

use std::{collections::HashSet, time::Instant};

use anyhow::Result;
use pgas_runtime::{Consistency, GlobalPtr, Runtime};

const REGION: u64 = 4 << 20;
const HEAP: usize = 1 << 20;

/// First offset above the heap bound; the application owns everything up
/// there by convention and can publish data without exchanging pointers.
const WELL_KNOWN: u64 = 2 << 20;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn bootstrap_gives_a_symmetric_mesh() {
    let nodes = common::cluster(3, REGION, HEAP).await;

    for node in &nodes {
        for peer in 0..nodes.len() as u16 {
            if peer != node.my_node() {
                assert!(node.is_connected(peer), "missing initiated socket");
            }
        }

        assert_eq!(node.num_nodes(), 3);
        assert!(node.segment(node.my_node()).unwrap().mapped);
        assert!(!node.segment((node.my_node() + 1) % 3).unwrap().mapped);
    }

    common::teardown(nodes).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn pointer_round_trip_local_and_remote() -> Result<()> {
    let nodes = common::cluster(2, REGION, HEAP).await;

    // One allocation per placement; the PUT-then-GET contract must not
    // depend on which branch the pointer takes.
    for target in [0u16, 1u16] {
        let ptr = nodes[0].alloc_on_node(256, target).await?;
        assert!(!ptr.is_null());
        assert_eq!(ptr.node(), target);

        let sent: Vec<u8> = (0..256).map(|i| (i % 251) as u8).collect();
        nodes[0].put(ptr, &sent).await?;
        nodes[0].fence(Consistency::SeqCst);

        let mut received = vec![0u8; 256];
        nodes[0].get(&mut received, ptr).await?;
        assert_eq!(received, sent);

        // Partial reads see a prefix of the same bytes.
        let mut head = vec![0u8; 64];
        nodes[0].get(&mut head, ptr).await?;
        assert_eq!(head, sent[..64]);

        nodes[0].free(ptr).await?;
    }

    // local_ptr only resolves pointers into the local segment.
    let remote = nodes[0].alloc_on_node(64, 1).await?;
    assert!(nodes[0].local_ptr(remote).is_null());
    assert!(!nodes[1].local_ptr(remote).is_null());
    nodes[1].free(remote).await?;

    common::teardown(nodes).await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_faa_is_exact_and_returns_are_distinct() -> Result<()> {
    const TURNS: u64 = 2_000;

    let nodes = common::cluster(2, REGION, HEAP).await;

    let counter = nodes[0].alloc_on_node(8, 1).await?;
    nodes[0].put(counter, &0u64.to_ne_bytes()).await?;

    async fn bump(runtime: Runtime, counter: GlobalPtr) -> Result<Vec<u64>> {
        let mut seen = Vec::with_capacity(TURNS as usize);
        for _ in 0..TURNS {
            seen.push(runtime.faa(counter, 1).await?);
        }

        Ok(seen)
    }

    let (a, b) = tokio::join!(
        bump(nodes[0].clone(), counter),
        bump(nodes[1].clone(), counter),
    );

    let mut returns: Vec<u64> = a?;
    returns.extend(b?);

    // K successful increments leave the cell at exactly K, and every
    // intermediate value was handed out exactly once.
    let mut raw = [0u8; 8];
    nodes[0].get(&mut raw, counter).await?;
    assert_eq!(u64::from_ne_bytes(raw), 2 * TURNS);

    let distinct: HashSet<u64> = returns.iter().copied().collect();
    assert_eq!(distinct.len(), returns.len());
    assert_eq!(*returns.iter().max().unwrap(), 2 * TURNS - 1);

    common::teardown(nodes).await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cas_race_admits_one_winner_per_value() -> Result<()> {
    const WINS: u64 = 500;

    let nodes = common::cluster(2, REGION, HEAP).await;

    let slot = nodes[0].alloc_on_node(8, 1).await?;
    nodes[0].put(slot, &0u64.to_ne_bytes()).await?;

    async fn race(runtime: Runtime, slot: GlobalPtr) -> Result<u64> {
        let mut wins = 0u64;
        let mut expected = 0u64;

        while wins < WINS {
            let observed = runtime.cas(slot, expected, expected + 1).await?;
            if observed == expected {
                wins += 1;
                expected = observed + 1;
            } else {
                // Lost the round; retry against what the owner holds now.
                expected = observed;
            }
        }

        Ok(wins)
    }

    let (a, b) = tokio::join!(race(nodes[0].clone(), slot), race(nodes[1].clone(), slot));
    assert_eq!(a? + b?, 2 * WINS);

    let mut raw = [0u8; 8];
    nodes[0].get(&mut raw, slot).await?;
    assert_eq!(u64::from_ne_bytes(raw), 2 * WINS);

    common::teardown(nodes).await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn bulk_transfer_is_byte_exact() -> Result<()> {
    let nodes = common::cluster(2, REGION, HEAP).await;

    let sent: Vec<u8> = (0..64 * 1024).map(|i| 0xAAu8.wrapping_add(i as u8)).collect();
    let target = GlobalPtr::new(1, WELL_KNOWN);

    nodes[0].put(target, &sent).await?;
    nodes[0].fence(Consistency::SeqCst);

    let mut received = vec![0u8; sent.len()];
    nodes[0].get(&mut received, target).await?;
    assert_eq!(received, sent);

    let totals = nodes[0].statistics().snapshot();
    assert_eq!(totals.remote_writes, 1);
    assert_eq!(totals.remote_reads, 1);
    assert!(totals.received_bytes >= sent.len());

    let peer = nodes[0].statistics().peer(1).unwrap();
    assert_eq!(peer.remote_writes, 1);

    common::teardown(nodes).await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn scattered_transfers_land_where_aimed() -> Result<()> {
    use rand::Rng;

    let nodes = common::cluster(2, REGION, HEAP).await;
    let mut rng = rand::rng();

    // A batch of random-size writes into random 8 KiB well-known slots.
    // Re-writing a slot replaces the expectation: the last write wins.
    let mut expected = std::collections::HashMap::new();
    for _ in 0..64 {
        let size = rng.random_range(1..=8192usize);
        let offset = WELL_KNOWN + rng.random_range(0..64u64) * 8192;

        let mut data = vec![0u8; size];
        rng.fill(&mut data[..]);

        nodes[0].put(GlobalPtr::new(1, offset), &data).await?;
        expected.insert(offset, data);
    }

    nodes[0].fence(Consistency::SeqCst);

    for (offset, data) in expected {
        let mut readback = vec![0u8; data.len()];
        nodes[0].get(&mut readback, GlobalPtr::new(1, offset)).await?;
        assert_eq!(readback, data, "slot at offset {}", offset);
    }

    common::teardown(nodes).await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn ping_pong_mirrors_monotonically() -> Result<()> {
    const ROUNDS: u64 = 200;

    let nodes = common::cluster(2, REGION, HEAP).await;

    fn read_slot(runtime: &Runtime) -> u64 {
        let addr = runtime.local_ptr(GlobalPtr::new(runtime.my_node(), WELL_KNOWN));
        unsafe { (addr as *const u64).read_volatile() }
    }

    // Node 1 mirrors every value it observes back to node 0's segment.
    let mirror = {
        let runtime = nodes[1].clone();
        tokio::spawn(async move {
            for i in 1..=ROUNDS {
                while read_slot(&runtime) != i {
                    tokio::task::yield_now().await;
                }

                runtime
                    .put(GlobalPtr::new(0, WELL_KNOWN), &i.to_ne_bytes())
                    .await?;
            }

            anyhow::Ok(())
        })
    };

    for i in 1..=ROUNDS {
        nodes[0]
            .put(GlobalPtr::new(1, WELL_KNOWN), &i.to_ne_bytes())
            .await?;

        while read_slot(&nodes[0]) != i {
            tokio::task::yield_now().await;
        }
    }

    mirror.await??;
    assert_eq!(read_slot(&nodes[0]), ROUNDS);

    common::teardown(nodes).await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn barrier_rendezvous_orders_every_pair() -> Result<()> {
    const ROUNDS: usize = 3;

    let nodes = common::cluster(4, 1 << 20, 1 << 19).await;

    async fn run(runtime: Runtime) -> Result<(Vec<Instant>, Vec<Instant>)> {
        let mut entries = Vec::with_capacity(ROUNDS);
        let mut exits = Vec::with_capacity(ROUNDS);

        for _ in 0..ROUNDS {
            entries.push(Instant::now());
            runtime.barrier().await?;
            exits.push(Instant::now());
        }

        Ok((entries, exits))
    }

    let mut tasks = Vec::new();
    for node in &nodes {
        tasks.push(tokio::spawn(run(node.clone())));
    }

    let mut traces = Vec::new();
    for task in tasks {
        traces.push(task.await??);
    }

    // No node may leave barrier k before every other node entered it.
    for (x, (_, exits)) in traces.iter().enumerate() {
        for (y, (entries, _)) in traces.iter().enumerate() {
            if x != y {
                for k in 0..ROUNDS {
                    assert!(exits[k] >= entries[k], "node {} left round {} early", x, k);
                }
            }
        }
    }

    for node in &nodes {
        assert_eq!(node.statistics().snapshot().barriers, ROUNDS);
    }

    common::teardown(nodes).await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn remote_heap_exhausts_to_null_and_recovers() -> Result<()> {
    let nodes = common::cluster(2, 1 << 20, 64 << 10).await;

    let mut held = Vec::new();
    loop {
        let ptr = nodes[0].alloc_on_node(16 << 10, 1).await?;
        if ptr.is_null() {
            break;
        }

        held.push(ptr);
    }

    assert!(!held.is_empty());

    // FREE is fire-and-forget but rides the same initiated socket as the
    // following ALLOC, so the owner processes them in order.
    for ptr in held.drain(..) {
        nodes[0].free(ptr).await?;
    }

    let again = nodes[0].alloc_on_node(16 << 10, 1).await?;
    assert!(!again.is_null());
    nodes[0].free(again).await?;

    common::teardown(nodes).await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn failed_get_zero_fills_the_destination() -> Result<()> {
    let nodes = common::cluster(2, REGION, HEAP).await;

    let remote = GlobalPtr::new(1, WELL_KNOWN);
    nodes[1].finalize().await;

    let mut dst = vec![0xFFu8; 512];
    let mut outcome = nodes[0].get(&mut dst, remote).await;

    // The peer may still be mid-teardown on the first try; the socket
    // discipline guarantees the failure surfaces, not how fast.
    for _ in 0..50 {
        if outcome.is_err() {
            break;
        }

        dst.fill(0xFF);
        outcome = nodes[0].get(&mut dst, remote).await;
    }

    assert!(outcome.is_err());
    assert!(dst.iter().all(|&byte| byte == 0));

    nodes[0].finalize().await;
    Ok(())
}
