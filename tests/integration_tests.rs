use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, RwLock};
use tokio::time::sleep;

use xrelay::config::{IngestCfg, Settings};
use xrelay::metrics::RelayMetrics;
use xrelay::{IngestSession, Packet, Registry, StreamInfo};

fn test_settings(outputs: Vec<&str>) -> Settings {
    Settings {
        reconnect_interval: 1,
        output_queue_size: 64,
        inputs: vec![IngestCfg {
            name: "live".to_string(),
            url_path: "/live/a".to_string(),
            outputs: outputs.into_iter().map(String::from).collect(),
        }],
        ..Settings::default()
    }
}

fn spawn_session(
    registry: &Arc<Registry>,
) -> (
    mpsc::UnboundedSender<Packet>,
    tokio::task::JoinHandle<()>,
) {
    let metrics = RelayMetrics::new();
    let info = Arc::new(RwLock::new(StreamInfo::default()));
    let (tx, rx) = mpsc::unbounded_channel();
    let session = IngestSession::new(
        "live".to_string(),
        registry.clone(),
        metrics,
        info,
        rx,
    );
    (tx, tokio::spawn(session.run()))
}

fn media_packet(i: u64) -> Packet {
    Packet::video(i * 33, 0, i % 30 == 0, vec![0x27, 0x01, 0, 0, 0, 0xAA, 0xBB])
}

mod session_lifecycle {
    use super::*;

    #[tokio::test]
    async fn publish_marks_ingest_active_with_no_outputs() {
        let registry = Arc::new(Registry::new(
            test_settings(vec![]),
            PathBuf::from("config.yaml"),
        ));
        let (tx, handle) = spawn_session(&registry);

        sleep(Duration::from_millis(100)).await;
        let status = registry.status("live").await.unwrap();
        assert!(status.active);
        assert_eq!(status.connections, 1);
        assert!(status.outputs.is_empty());

        drop(tx);
        handle.await.unwrap();
        let status = registry.status("live").await.unwrap();
        assert!(!status.active);
        assert_eq!(status.connections, 0);
    }

    #[tokio::test]
    async fn file_output_added_at_runtime_grows_and_disappears_on_removal() {
        let path = std::env::temp_dir().join("xrelay_integration_grow.flv");
        let url = format!("file://{}", path.display());
        let _ = std::fs::remove_file(&path);

        let registry = Arc::new(Registry::new(
            test_settings(vec![]),
            PathBuf::from("config.yaml"),
        ));
        let (tx, handle) = spawn_session(&registry);

        // feed media while declaring the output at runtime
        let feeder = {
            let tx = tx.clone();
            tokio::spawn(async move {
                for i in 0..400u64 {
                    if tx.send(media_packet(i)).is_err() {
                        return;
                    }
                    sleep(Duration::from_millis(10)).await;
                }
            })
        };

        registry.add_output_url("live", &url).await.unwrap();

        // within one reconciliation tick the worker exists and the file
        // starts growing
        sleep(Duration::from_millis(2_600)).await;
        let first = std::fs::metadata(&path).expect("file created").len();
        sleep(Duration::from_millis(500)).await;
        let second = std::fs::metadata(&path).unwrap().len();
        assert!(second > first, "file should grow while packets flow");

        // removal stops the growth and deletes the status entry
        registry.remove_output_url("live", &url).await.unwrap();
        sleep(Duration::from_millis(2_600)).await;
        let frozen = std::fs::metadata(&path).unwrap().len();
        sleep(Duration::from_millis(500)).await;
        assert_eq!(std::fs::metadata(&path).unwrap().len(), frozen);
        assert!(registry.status("live").await.unwrap().outputs.is_empty());

        feeder.abort();
        drop(tx);
        handle.await.unwrap();
        let _ = std::fs::remove_file(&path);
    }
}

mod fanout_isolation {
    use super::*;

    #[tokio::test]
    async fn unreachable_output_does_not_stall_siblings() {
        let path = std::env::temp_dir().join("xrelay_integration_isolation.flv");
        let file_url = format!("file://{}", path.display());
        let _ = std::fs::remove_file(&path);

        // port 1 refuses connections; the rtmp worker will sit in its
        // dial/backoff loop for the whole test
        let dead_url = "rtmp://127.0.0.1:1/live/dead";
        let registry = Arc::new(Registry::new(
            test_settings(vec![dead_url, file_url.as_str()]),
            PathBuf::from("config.yaml"),
        ));
        let (tx, handle) = spawn_session(&registry);

        let start = std::time::Instant::now();
        for i in 0..500u64 {
            tx.send(media_packet(i)).unwrap();
        }
        // the source side never blocks on the dead output
        assert!(start.elapsed() < Duration::from_millis(500));

        sleep(Duration::from_millis(2_500)).await;
        let status = registry.status("live").await.unwrap();
        let dead = status
            .outputs
            .iter()
            .find(|o| o.url == dead_url)
            .expect("dead output registered");
        let file = status
            .outputs
            .iter()
            .find(|o| o.url == file_url)
            .expect("file output registered");

        assert!(!dead.active);
        assert!(dead.error_count >= 1, "dial failures are counted");
        assert!(file.active, "sibling output keeps writing");
        assert!(std::fs::metadata(&path).unwrap().len() > 0);

        drop(tx);
        handle.await.unwrap();
        let _ = std::fs::remove_file(&path);
    }
}

mod status_accounting {
    use super::*;

    #[tokio::test]
    async fn bitrate_zero_after_deactivation() {
        let registry = Arc::new(Registry::new(
            test_settings(vec![]),
            PathBuf::from("config.yaml"),
        ));
        registry.register_output("live", "srt://h:9000").await;
        registry.set_output_active("live", "srt://h:9000", true).await;

        registry.update_output_bitrate("live", "srt://h:9000", 0).await;
        sleep(Duration::from_millis(600)).await;
        registry
            .update_output_bitrate("live", "srt://h:9000", 250_000)
            .await;
        let status = registry.status("live").await.unwrap();
        assert!(status.outputs[0].bitrate_kbps > 0.0);

        registry
            .set_output_active("live", "srt://h:9000", false)
            .await;
        let status = registry.status("live").await.unwrap();
        assert_eq!(status.outputs[0].bitrate_kbps, 0.0);
        assert_eq!(status.outputs[0].uptime, "00:00:00");
    }

    #[tokio::test]
    async fn force_reconnect_is_visible_in_status() {
        let registry = Arc::new(Registry::new(
            test_settings(vec![]),
            PathBuf::from("config.yaml"),
        ));
        registry.register_output("live", "rtmp://a/b/c").await;
        registry.set_output_active("live", "rtmp://a/b/c", true).await;

        registry.force_reconnect("live", "rtmp://a/b/c").await;
        let status = registry.status("live").await.unwrap();
        assert!(!status.outputs[0].active);
        assert_eq!(status.outputs[0].error_count, 1);
    }
}
