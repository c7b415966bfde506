use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use partycomm::{
    CommunicationError, Communicator, CommunicatorOptions, Device, Error, REDUCE_ROOT, ReduceOp,
    Violation, channel::SimpleChannel,
};
use rand::RngCore;
use serde::{Deserialize, Serialize};

mod common;

use common::{communicators, run_on, run_parties};

#[tokio::test]
async fn all_reduce_sums_at_every_party() {
    let results = run_parties(3, |comm| async move {
        let rank = comm.get_rank() as u64;
        comm.all_reduce(vec![rank + 1; 4], ReduceOp::Sum).await
    })
    .await;
    assert_eq!(results, vec![vec![6u64; 4]; 3]);
}

#[tokio::test]
async fn reduce_delivers_only_at_root() {
    let results = run_parties(4, |comm| async move {
        let rank = comm.get_rank() as i32;
        comm.reduce(vec![rank, -rank], ReduceOp::Max).await
    })
    .await;
    for (rank, result) in results.into_iter().enumerate() {
        if rank == REDUCE_ROOT {
            assert_eq!(result, Some(vec![3, 0]));
        } else {
            assert_eq!(result, None);
        }
    }
}

#[tokio::test]
async fn reduce_defaults_to_sum() {
    let results = run_parties(2, |comm| async move {
        comm.all_reduce(u8::MAX, ReduceOp::default()).await
    })
    .await;
    assert_eq!(results, vec![u8::MAX.wrapping_add(u8::MAX); 2]);
}

#[tokio::test]
async fn gather_orders_by_rank() {
    let results = run_parties(3, |comm| async move {
        let rank = comm.get_rank() as u32;
        comm.gather(vec![rank; 2], 2).await
    })
    .await;
    assert_eq!(results[0], None);
    assert_eq!(results[1], None);
    assert_eq!(results[2], Some(vec![vec![0, 0], vec![1, 1], vec![2, 2]]));
}

#[tokio::test]
async fn all_gather_orders_by_rank() {
    let results = run_parties(4, |comm| async move {
        let rank = comm.get_rank() as f64;
        comm.all_gather(rank * 0.5).await
    })
    .await;
    for gathered in results {
        assert_eq!(gathered, vec![0.0, 0.5, 1.0, 1.5]);
    }
}

#[tokio::test]
async fn broadcast_ignores_non_source_values() {
    let results = run_parties(3, |comm| async move {
        let rank = comm.get_rank() as u64;
        comm.broadcast(vec![rank; 3], 1).await
    })
    .await;
    assert_eq!(results, vec![vec![1u64; 3]; 3]);
}

#[tokio::test]
async fn scatter_delivers_destined_values() {
    let results = run_parties(3, |comm| async move {
        let values = if comm.get_rank() == 2 {
            vec![vec![10u64, 11], vec![20, 21], vec![30, 31]]
        } else {
            vec![]
        };
        comm.scatter(values, 2, Some(2)).await
    })
    .await;
    assert_eq!(results, vec![vec![10, 11], vec![20, 21], vec![30, 31]]);
}

#[tokio::test]
async fn scatter_requires_one_value_per_party() {
    let comms = communicators(3);
    let err = comms[0]
        .scatter(vec![1u64, 2], 0, None)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::ContractViolation(Violation::ScatterLength {
            expected: 3,
            actual: 2
        })
    ));
}

#[tokio::test]
async fn send_and_recv_between_two_parties() {
    let results = run_parties(3, |comm| async move {
        match comm.get_rank() {
            0 => {
                comm.send(&vec![7u16, 8, 9], 2).await?;
                Ok::<_, Error>(None)
            }
            2 => {
                let mut buf = vec![0u16; 3];
                let src = comm.recv(&mut buf, Some(0)).await?;
                Ok(Some((src, buf)))
            }
            _ => Ok(None),
        }
    })
    .await;
    assert_eq!(results[2], Some((0, vec![7, 8, 9])));
}

#[tokio::test]
async fn recv_from_any_source_reports_sender() {
    let results = run_parties(3, |comm| async move {
        let rank = comm.get_rank();
        if rank == 0 {
            let mut sources = BTreeSet::new();
            let mut values = BTreeSet::new();
            for _ in 0..2 {
                let mut buf = 0u64;
                sources.insert(comm.recv(&mut buf, None).await?);
                values.insert(buf);
            }
            Ok::<_, Error>(Some((sources, values)))
        } else {
            comm.send(&(rank as u64 * 100), 0).await?;
            Ok(None)
        }
    })
    .await;
    let (sources, values) = results[0].clone().unwrap();
    assert_eq!(sources, BTreeSet::from([1, 2]));
    assert_eq!(values, BTreeSet::from([100, 200]));
}

#[tokio::test]
async fn recv_from_any_source_outlives_closed_peers() {
    let comms = communicators(3);
    comms[1].close().await;
    comms[2].send(&vec![7u64, 8], 0).await.unwrap();
    let mut buf = vec![0u64; 2];
    assert_eq!(comms[0].recv(&mut buf, None).await.unwrap(), 2);
    assert_eq!(buf, vec![7, 8]);
}

#[tokio::test]
async fn recv_rejects_length_mismatch() {
    let comms = communicators(2);
    comms[0].send(&vec![1i64, 2, 3], 1).await.unwrap();
    let mut buf = vec![0i64; 2];
    let err = comms[1].recv(&mut buf, Some(0)).await.unwrap_err();
    assert!(matches!(
        err,
        Error::ContractViolation(Violation::LengthMismatch {
            expected: 2,
            actual: 3
        })
    ));
    assert_eq!(buf, vec![0, 0]);
}

#[tokio::test]
async fn invalid_ranks_are_rejected() {
    let comms = communicators(2);
    let err = comms[0].send(&1u32, 0).await.unwrap_err();
    assert!(matches!(
        err,
        Error::Communication(CommunicationError::InvalidRank {
            party: 0,
            rank: 0,
            world_size: 2
        })
    ));
    let err = comms[1].broadcast(1u32, 5).await.unwrap_err();
    assert!(matches!(
        err,
        Error::Communication(CommunicationError::InvalidRank { party: 5, .. })
    ));
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Metadata {
    table: String,
    columns: Vec<String>,
    rows: usize,
}

#[tokio::test]
async fn objects_are_exchanged_point_to_point() {
    let comms = communicators(2);
    let meta = Metadata {
        table: "visits".to_string(),
        columns: vec!["id".to_string(), "age".to_string()],
        rows: 42,
    };
    comms[1].send_obj(&meta, 0).await.unwrap();
    let received: Metadata = comms[0].recv_obj(1).await.unwrap();
    assert_eq!(received, meta);
}

#[tokio::test]
async fn objects_are_broadcast() {
    let results = run_parties(3, |comm| async move {
        let obj = (comm.get_rank() == 0)
            .then(|| BTreeMap::from([("parties".to_string(), 3u8), ("rounds".to_string(), 2)]));
        comm.broadcast_obj(obj, 0).await
    })
    .await;
    for map in results {
        assert_eq!(map.get("parties"), Some(&3));
        assert_eq!(map.get("rounds"), Some(&2));
    }
}

#[tokio::test]
async fn broadcast_obj_requires_object_at_source() {
    let comms = communicators(3);
    let err = comms[1]
        .broadcast_obj::<String>(None, 1)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::ContractViolation(Violation::MissingObject { src: 1 })
    ));
}

#[tokio::test]
async fn payload_and_object_frames_do_not_mix() {
    let comms = communicators(2);
    comms[0].send_obj(&"metadata".to_string(), 1).await.unwrap();
    let mut buf = 0u64;
    let err = comms[1].recv(&mut buf, Some(0)).await.unwrap_err();
    assert!(matches!(
        err,
        Error::Communication(CommunicationError::UnexpectedFrame {
            party: 0,
            expected: "payload",
            actual: "object"
        })
    ));
}

#[tokio::test]
async fn barrier_waits_for_every_party() {
    let entered = Arc::new(AtomicUsize::new(0));
    let results = run_parties(4, |comm| {
        let entered = Arc::clone(&entered);
        async move {
            let rank = comm.get_rank();
            tokio::time::sleep(Duration::from_millis(10 * rank as u64)).await;
            entered.fetch_add(1, Ordering::SeqCst);
            comm.barrier().await?;
            Ok::<_, Error>(entered.load(Ordering::SeqCst))
        }
    })
    .await;
    assert_eq!(results, vec![4; 4]);
}

#[tokio::test]
async fn async_operations_keep_issue_order() {
    let results = run_parties(3, |comm| async move {
        let rank = comm.get_rank() as u64;
        let reduced = comm.all_reduce_async(vec![rank; 2], ReduceOp::Sum).await?;
        let gathered = comm.all_gather_async(rank).await?;
        let broadcast = comm.broadcast(rank + 100, 2).await?;
        Ok::<_, Error>((reduced.wait().await?, gathered.wait().await?, broadcast))
    })
    .await;
    for (reduced, gathered, broadcast) in results {
        assert_eq!(reduced, vec![3, 3]);
        assert_eq!(gathered, vec![0, 1, 2]);
        assert_eq!(broadcast, 102);
    }
}

#[tokio::test]
async fn async_rooted_operations() {
    let results = run_parties(2, |comm| async move {
        let rank = comm.get_rank();
        let values = if rank == 0 { vec![5u32, 6] } else { vec![] };
        let scattered = comm.scatter_async(values, 0, Some(1)).await?.wait().await?;
        let gathered = comm.gather_async(scattered, 1).await?.wait().await?;
        let reduced = comm
            .reduce_async(scattered, ReduceOp::Product)
            .await?
            .wait()
            .await?;
        let broadcast = comm.broadcast_async(rank, 1).await?.wait().await?;
        Ok::<_, Error>((scattered, gathered, reduced, broadcast))
    })
    .await;
    assert_eq!(results[0], (5, None, Some(30), 1));
    assert_eq!(results[1], (6, Some(vec![5, 6]), None, 1));
}

#[tokio::test]
async fn batches_move_in_one_call() {
    let results = run_parties(3, |comm| async move {
        let rank = comm.get_rank() as i64;
        let summed = comm
            .all_reduce_batch(vec![vec![rank; 2], vec![-rank; 3]], ReduceOp::Sum)
            .await?;
        let minimum = comm.reduce_batch(vec![rank, 10 - rank], ReduceOp::Min).await?;
        let broadcast = comm.broadcast_batch(vec![rank, rank * 2], 1).await?;
        Ok::<_, Error>((summed, minimum, broadcast))
    })
    .await;
    for (rank, (summed, minimum, broadcast)) in results.into_iter().enumerate() {
        assert_eq!(summed, vec![vec![3, 3], vec![-3, -3, -3]]);
        assert_eq!(minimum, (rank == REDUCE_ROOT).then(|| vec![0, 8]));
        assert_eq!(broadcast, vec![1, 2]);
    }
}

#[tokio::test]
async fn neighbours_share_generators() {
    for n in [2, 3, 5] {
        let draws = run_parties(n, |comm| async move {
            comm.setup_generators(Device::Cpu).await?;
            let next = comm.with_generator(0, None, |rng| rng.next_u64())?;
            let prev = comm.with_generator(1, Some(Device::Cpu), |rng| rng.next_u64())?;
            Ok::<_, Error>((next, prev))
        })
        .await;
        for rank in 0..n {
            let (next, _) = draws[rank];
            let (_, prev_of_next) = draws[(rank + 1) % n];
            assert_eq!(next, prev_of_next, "rank {rank} of {n}");
        }
    }
}

#[tokio::test]
async fn generators_must_be_provisioned() {
    let comms = communicators(2);
    let err = comms[0]
        .with_generator(0, Some(Device::Accelerator), |rng| rng.next_u32())
        .unwrap_err();
    assert!(matches!(
        err,
        Error::GeneratorNotInitialized {
            slot: 0,
            device: Device::Accelerator
        }
    ));
    let err = comms[0].with_generator(2, None, |rng| rng.next_u32()).unwrap_err();
    assert!(matches!(err, Error::OutOfRange { slot: 2 }));

    run_on(&comms, |comm| async move {
        comm.setup_generators("cuda:0".parse()?).await
    })
    .await;
    assert!(comms[1].generators().is_provisioned(1, Device::Accelerator));
    assert!(!comms[1].generators().is_provisioned(1, Device::Cpu));
}

#[tokio::test]
async fn closed_communicator_is_unusable() {
    let comms = communicators(2);
    comms[0].close().await;
    assert!(comms[0].is_closed());
    assert!(!comms[1].is_closed());
    assert!(matches!(
        comms[0].all_reduce(1u64, ReduceOp::Sum).await,
        Err(Error::NotInitialized)
    ));
    assert!(matches!(comms[0].barrier().await, Err(Error::NotInitialized)));
    assert!(matches!(
        comms[0].recv_obj::<String>(1).await,
        Err(Error::NotInitialized)
    ));
}

#[tokio::test]
async fn closed_single_party_rejects_payload_operations() {
    let channel = SimpleChannel::channels(1).remove(0);
    let comm = Communicator::new(CommunicatorOptions::default(), channel).unwrap();
    comm.close().await;
    assert!(matches!(
        comm.all_reduce(5u64, ReduceOp::Sum).await,
        Err(Error::NotInitialized)
    ));
    assert!(matches!(comm.all_gather(5u64).await, Err(Error::NotInitialized)));
    assert!(matches!(
        comm.broadcast_obj(Some(5u64), 0).await,
        Err(Error::NotInitialized)
    ));
}

#[tokio::test]
async fn failed_call_leaves_communicator_usable() {
    let comms = communicators(2);
    assert!(comms[0].send(&1u8, 9).await.is_err());
    let results = run_on(&comms, |comm| async move {
        comm.all_gather(comm.get_rank() as u8).await
    })
    .await;
    assert_eq!(results, vec![vec![0, 1]; 2]);
}

#[tokio::test]
async fn single_party_returns_inputs() {
    let channel = SimpleChannel::channels(1).remove(0);
    let comm = Communicator::new(CommunicatorOptions::default(), channel).unwrap();

    assert_eq!(comm.scatter(vec![vec![1u8, 2]], 0, None).await.unwrap(), vec![1, 2]);
    assert!(matches!(
        comm.scatter(vec![1u8, 2], 0, None).await,
        Err(Error::ContractViolation(Violation::ScatterLength {
            expected: 1,
            actual: 2
        }))
    ));
    comm.send(&5u32, 3).await.unwrap();
    let mut buf = 9u32;
    assert_eq!(comm.recv(&mut buf, None).await.unwrap(), 0);
    assert_eq!(buf, 9);
    assert_eq!(comm.gather(4u32, 0).await.unwrap(), Some(vec![4]));
    assert_eq!(comm.all_gather(4u32).await.unwrap(), vec![4]);
    assert_eq!(comm.reduce(4u32, ReduceOp::Max).await.unwrap(), Some(4));
    assert_eq!(comm.all_reduce(4u32, ReduceOp::Sum).await.unwrap(), 4);
    assert_eq!(comm.broadcast(4u32, 0).await.unwrap(), 4);
    assert_eq!(
        comm.broadcast_obj(Some("meta".to_string()), 0).await.unwrap(),
        "meta"
    );
    comm.barrier().await.unwrap();

    let pending = comm.all_reduce_async(vec![1.5f32], ReduceOp::Sum).await.unwrap();
    assert!(pending.is_finished());
    assert_eq!(pending.wait().await.unwrap(), vec![1.5]);

    comm.setup_generators(Device::Cpu).await.unwrap();
    assert!(comm.generators().is_provisioned(0, Device::Cpu));
}

#[tokio::test]
async fn identity() {
    let comms = communicators(3);
    assert_eq!(comms[1].get_rank(), 1);
    assert_eq!(comms[1].get_world_size(), 3);
    assert_eq!(comms[1].get_name(), "rank1");
    comms[1].set_name("hospital-b");
    assert_eq!(comms[1].get_name(), "hospital-b");
    assert_eq!(comms[2].get_name(), "rank2");

    let channel = SimpleChannel::channels(2).remove(0);
    let named = CommunicatorOptions::new(0, 2).with_name("clinic");
    let comm = Communicator::new(named, channel).unwrap();
    assert_eq!(comm.get_name(), "clinic");
}

#[tokio::test]
async fn invalid_options_are_rejected() {
    let channel = SimpleChannel::channels(2).remove(0);
    let err = Communicator::new(CommunicatorOptions::new(2, 2), channel).unwrap_err();
    assert!(matches!(err, Error::Initialization(_)));
}
