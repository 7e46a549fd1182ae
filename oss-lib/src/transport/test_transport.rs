use crate::coordinator::tests::TableMaster;
use crate::{
    read_fragment_request, write_fragment_response, ChunkServer, ChunkServerGroups,
    ChunkServerStatus, Coordinator, GlobalStatus, OssError, RouteConfig,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Once};
use tokio::io::BufStream;
use tokio::net::TcpListener;

static INIT_LOGGER: Once = Once::new();

fn init_logging() {
    INIT_LOGGER.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
}

type FragmentStore = Arc<Mutex<HashMap<(String, u64, u64, u64), Vec<u8>>>>;

/// Minimal chunk server speaking the fragment protocol over keep-alive
/// connections, storing bodies in memory.
async fn spawn_chunk_server(store: FragmentStore, fail_writes: bool) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(_) => break,
            };
            let store = store.clone();
            tokio::spawn(async move {
                let mut stream = BufStream::new(socket);
                while let Ok(Some(req)) = read_fragment_request(&mut stream).await {
                    let frag_key = (
                        req.key.path.clone(),
                        req.key.index,
                        req.key.start,
                        req.key.end,
                    );
                    let (code, body) = match req.method.as_str() {
                        "POST" => {
                            if fail_writes {
                                (500, b"disk full".to_vec())
                            } else {
                                store.lock().unwrap().insert(frag_key, req.body);
                                (200, Vec::new())
                            }
                        }
                        "GET" => match store.lock().unwrap().get(&frag_key).cloned() {
                            Some(bytes) => (200, bytes),
                            None => (404, b"fragment not found".to_vec()),
                        },
                        _ => (400, b"unsupported method".to_vec()),
                    };
                    if write_fragment_response(&mut stream, code, &body).await.is_err() {
                        break;
                    }
                }
            });
        }
    });
    port
}

fn route_for_ports(ports: &[u16]) -> ChunkServerGroups {
    let members = ports
        .iter()
        .map(|port| ChunkServer {
            host: "127.0.0.1".to_string(),
            port: *port,
            group_id: 1,
            status: ChunkServerStatus::ReadWrite,
            global_status: GlobalStatus::Normal,
            max_free_space: 1 << 30,
            pending_writes: 0,
            writing_count: 0,
        })
        .collect();
    let mut groups = ChunkServerGroups::new();
    groups.insert(1, members);
    groups
}

async fn coordinator_for_ports(ports: &[u16], limit_num: usize) -> Arc<Coordinator> {
    let master = Arc::new(TableMaster::new(route_for_ports(ports)));
    let config = RouteConfig {
        limit_num,
        ..RouteConfig::default()
    };
    let coordinator = Arc::new(Coordinator::new(master, config));
    coordinator.refresh_route().await.unwrap();
    coordinator
}

#[tokio::test]
async fn test_write_replicates_to_every_rw_member_and_reads_back() {
    init_logging();
    let stores: Vec<FragmentStore> = (0..3).map(|_| FragmentStore::default()).collect();
    let mut ports = Vec::new();
    for store in &stores {
        ports.push(spawn_chunk_server(store.clone(), false).await);
    }
    let coordinator = coordinator_for_ports(&ports, 3).await;

    let payload = b"fragment payload bytes".to_vec();
    let end = payload.len() as u64;
    let value = coordinator
        .write_fragment("/bucket/movie.mkv", 0, 0, end, true, payload.clone())
        .await
        .unwrap();
    assert_eq!(value.group_id, 1);
    assert_eq!((value.start, value.end), (0, end));
    assert!(value.is_last);

    // every replica holds the bytes
    let frag_key = ("/bucket/movie.mkv".to_string(), 0u64, 0u64, end);
    for store in &stores {
        assert_eq!(store.lock().unwrap().get(&frag_key), Some(&payload));
    }

    let read_back = coordinator
        .read_fragment("/bucket/movie.mkv", &value)
        .await
        .unwrap();
    assert_eq!(read_back, payload);
}

#[tokio::test]
async fn test_one_failing_replica_fails_the_whole_write() {
    init_logging();
    let store_ok_1 = FragmentStore::default();
    let store_bad = FragmentStore::default();
    let store_ok_2 = FragmentStore::default();
    let ports = vec![
        spawn_chunk_server(store_ok_1.clone(), false).await,
        spawn_chunk_server(store_bad.clone(), true).await,
        spawn_chunk_server(store_ok_2.clone(), false).await,
    ];
    let coordinator = coordinator_for_ports(&ports, 3).await;

    let payload = vec![7u8; 64];
    let err = coordinator
        .write_fragment("/bucket/a.bin", 0, 0, 64, true, payload)
        .await
        .unwrap_err();
    assert!(matches!(err, OssError::PartialWrite(_)));
    // the failed replica stored nothing; orphaned copies on the healthy
    // ones are left in place
    assert!(store_bad.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_length_mismatch_rejected_before_any_network_call() {
    init_logging();
    let store = FragmentStore::default();
    let port = spawn_chunk_server(store.clone(), false).await;
    let coordinator = coordinator_for_ports(&[port], 1).await;

    let err = coordinator
        .write_fragment("/bucket/b.bin", 0, 0, 128, false, vec![1u8; 100])
        .await
        .unwrap_err();
    assert!(matches!(err, OssError::InvalidParam(_)));
    let err = coordinator
        .write_fragment("/bucket/b.bin", 0, 10, 10, false, Vec::new())
        .await
        .unwrap_err();
    assert!(matches!(err, OssError::InvalidParam(_)));
    assert!(store.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_read_missing_fragment_maps_remote_404() {
    init_logging();
    let store = FragmentStore::default();
    let port = spawn_chunk_server(store, false).await;
    let coordinator = coordinator_for_ports(&[port], 1).await;

    let value = crate::MetaInfoValue {
        index: 0,
        start: 0,
        end: 16,
        is_last: true,
        fid: 99,
        group_id: 1,
    };
    let err = coordinator
        .read_fragment("/bucket/ghost.bin", &value)
        .await
        .unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn test_read_unknown_group_is_not_found() {
    init_logging();
    let store = FragmentStore::default();
    let port = spawn_chunk_server(store, false).await;
    let coordinator = coordinator_for_ports(&[port], 1).await;

    let value = crate::MetaInfoValue {
        index: 0,
        start: 0,
        end: 16,
        is_last: true,
        fid: 1,
        group_id: 42,
    };
    let err = coordinator
        .read_fragment("/bucket/c.bin", &value)
        .await
        .unwrap_err();
    assert!(matches!(err, OssError::NotFound(_)));
}

#[tokio::test]
async fn test_sequential_fragments_reuse_pooled_connections() {
    init_logging();
    let store = FragmentStore::default();
    let port = spawn_chunk_server(store, false).await;
    let coordinator = coordinator_for_ports(&[port], 1).await;

    let mut values = Vec::new();
    for index in 0..4u64 {
        let start = index * 32;
        let end = start + 32;
        let payload = vec![index as u8; 32];
        let value = coordinator
            .write_fragment("/bucket/parts.bin", index, start, end, index == 3, payload)
            .await
            .unwrap();
        values.push(value);
    }
    // fids are distinct across fragments
    let mut fids: Vec<u64> = values.iter().map(|v| v.fid).collect();
    fids.dedup();
    assert_eq!(fids.len(), 4);
    for (index, value) in values.iter().enumerate() {
        let bytes = coordinator
            .read_fragment("/bucket/parts.bin", value)
            .await
            .unwrap();
        assert_eq!(bytes, vec![index as u8; 32]);
    }
    // the single keep-alive connection was returned to the pool
    let pool = coordinator
        .snapshot()
        .pools
        .get(&format!("127.0.0.1:{}", port))
        .unwrap();
    assert!(pool.idle_count() >= 1);
}
