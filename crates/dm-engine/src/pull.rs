//! Layer-by-layer image pull progress.
//!
//! Streams the engine's pull status lines, tracks per-layer byte counts,
//! smooths the download speed over a 3-sample window, and emits throttled
//! snapshots: at most every 500 ms, or on a >= 5 % jump, or on a layer
//! completion/cache transition.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use dm_common::DmError;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use crate::client::EngineClient;

const THROTTLE_MS: u128 = 500;
const THROTTLE_PERCENT: i64 = 5;
const VERIFY_ATTEMPTS: u32 = 5;
/// Layers beyond this count are summarized, not listed.
const MAX_BROADCAST_LAYERS: usize = 20;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayerProgress {
    pub id: String,
    pub status: String,
    pub current: u64,
    pub total: u64,
    pub percent: i64,
}

/// One throttled progress emission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullSnapshot {
    pub overall_progress: i64,
    pub layers: Vec<LayerProgress>,
    pub total_layers: usize,
    pub remaining_layers: usize,
    pub summary: String,
    pub speed_mbps: f64,
}

#[derive(Default)]
struct LayerState {
    status: String,
    current: u64,
    total: u64,
}

fn status_priority(status: &str) -> u8 {
    match status {
        "Pulling fs layer" => 0,
        "Downloading" => 1,
        "Extracting" => 2,
        "Verifying Checksum" => 3,
        "Download complete" => 4,
        "Already exists" => 5,
        "Pull complete" => 6,
        _ => 99,
    }
}

fn build_snapshot(
    layers: &HashMap<String, LayerState>,
    overall: i64,
    speed_mbps: f64,
) -> PullSnapshot {
    let total_layers = layers.len();
    let downloading = layers.values().filter(|l| l.status == "Downloading").count();
    let extracting = layers.values().filter(|l| l.status == "Extracting").count();
    let complete = layers
        .values()
        .filter(|l| l.status.to_lowercase().contains("complete"))
        .count();
    let cached = layers.values().filter(|l| l.status == "Already exists").count();

    let summary = if total_layers == 0 {
        "Pull complete (manifest only)".to_string()
    } else if downloading > 0 {
        let speed = if speed_mbps > 0.0 {
            format!(" @ {speed_mbps:.1} MB/s")
        } else {
            String::new()
        };
        format!("Downloading {downloading} of {total_layers} layers ({overall}%){speed}")
    } else if extracting > 0 {
        format!("Extracting {extracting} of {total_layers} layers ({overall}%)")
    } else if complete + cached == total_layers {
        let cache = if cached > 0 {
            format!(" ({cached} cached)")
        } else {
            String::new()
        };
        format!("Pull complete ({total_layers} layers{cache})")
    } else {
        format!("Pulling image ({overall}%)")
    };

    let mut list: Vec<LayerProgress> = layers
        .iter()
        .map(|(id, l)| LayerProgress {
            id: id.clone(),
            status: l.status.clone(),
            current: l.current,
            total: l.total,
            percent: if l.total > 0 {
                (l.current as f64 / l.total as f64 * 100.0) as i64
            } else {
                0
            },
        })
        .collect();
    // Active layers first so the UI shows what is moving
    list.sort_by_key(|l| status_priority(&l.status));

    let remaining = list.len().saturating_sub(MAX_BROADCAST_LAYERS);
    list.truncate(MAX_BROADCAST_LAYERS);

    PullSnapshot {
        overall_progress: overall,
        layers: list,
        total_layers,
        remaining_layers: remaining,
        summary,
        speed_mbps,
    }
}

/// Pull an image, invoking `emit` with throttled snapshots, and verify the
/// image landed in the engine's store before returning.
pub async fn pull_with_progress(
    client: &EngineClient,
    image: &str,
    auth: Option<&(String, String)>,
    timeout: Duration,
    mut emit: impl FnMut(PullSnapshot),
) -> Result<(), DmError> {
    let start = Instant::now();
    let resp = client.pull_stream(image, auth).await?;
    let mut stream = resp.bytes_stream();

    let mut layers: HashMap<String, LayerState> = HashMap::new();
    let mut buffer = Vec::new();
    let mut last_broadcast = Instant::now() - Duration::from_millis(THROTTLE_MS as u64);
    let mut last_percent: i64 = 0;
    let mut last_speed_check = Instant::now();
    let mut last_total_bytes: u64 = 0;
    let mut speed_samples: Vec<f64> = Vec::new();
    let mut speed_mbps = 0.0;

    while let Some(chunk) = stream.next().await {
        if start.elapsed() > timeout {
            return Err(DmError::Timeout(format!(
                "Image pull exceeded {} seconds",
                timeout.as_secs()
            )));
        }
        let chunk = chunk.map_err(|e| DmError::engine(None, e.to_string()))?;
        buffer.extend_from_slice(&chunk);

        // The stream is newline-delimited JSON; keep the trailing partial line.
        while let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = buffer.drain(..=pos).collect();
            let Ok(value) = serde_json::from_slice::<Value>(&line) else {
                continue;
            };

            if let Some(message) = value.get("error").and_then(Value::as_str) {
                return Err(DmError::engine(None, message.to_string()));
            }

            let Some(layer_id) = value.get("id").and_then(Value::as_str) else {
                continue; // "Pulling from library/nginx" etc.
            };
            let status = value
                .get("status")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();

            let entry = layers.entry(layer_id.to_string()).or_default();
            if status == "Already exists" || status == "Pull complete" {
                // Cached or finished layer counts as fully downloaded
                entry.current = entry.total;
                entry.status = status.clone();
            } else {
                let detail = value.get("progressDetail");
                let current = detail
                    .and_then(|d| d.get("current"))
                    .and_then(Value::as_u64)
                    .unwrap_or(0);
                let total = detail
                    .and_then(|d| d.get("total"))
                    .and_then(Value::as_u64)
                    .unwrap_or(0);
                entry.current = current;
                if total > 0 {
                    entry.total = total;
                }
                entry.status = status.clone();
            }

            let total_bytes: u64 = layers.values().filter(|l| l.total > 0).map(|l| l.total).sum();
            let downloaded: u64 = layers.values().map(|l| l.current).sum();
            let overall = if total_bytes > 0 {
                (downloaded as f64 / total_bytes as f64 * 100.0) as i64
            } else {
                let complete = layers
                    .values()
                    .filter(|l| {
                        l.status.to_lowercase().contains("complete")
                            || l.status == "Already exists"
                    })
                    .count();
                (complete as f64 / layers.len().max(1) as f64 * 100.0) as i64
            };

            // Speed sampled once a second through a 3-sample moving average
            let elapsed = last_speed_check.elapsed().as_secs_f64();
            if elapsed >= 1.0 {
                let delta = downloaded.saturating_sub(last_total_bytes);
                if delta > 0 {
                    let raw = (delta as f64 / elapsed) / (1024.0 * 1024.0);
                    speed_samples.push(raw);
                    if speed_samples.len() > 3 {
                        speed_samples.remove(0);
                    }
                    speed_mbps = speed_samples.iter().sum::<f64>() / speed_samples.len() as f64;
                }
                last_total_bytes = downloaded;
                last_speed_check = Instant::now();
            }

            let should_broadcast = last_broadcast.elapsed().as_millis() >= THROTTLE_MS
                || (overall - last_percent).abs() >= THROTTLE_PERCENT
                || status.to_lowercase().contains("complete")
                || status == "Already exists";

            if should_broadcast {
                emit(build_snapshot(&layers, overall, speed_mbps));
                last_broadcast = Instant::now();
                last_percent = overall;
            }
        }
    }

    emit(build_snapshot(&layers, 100, speed_mbps));

    // The stream ending does not guarantee the image is committed to the
    // engine's store; verify with backoff before declaring success.
    let mut delay = Duration::from_millis(500);
    for attempt in 0..VERIFY_ATTEMPTS {
        match client.inspect_image(image).await {
            Ok(_) => {
                info!(image, layers = layers.len(), "Image pull complete");
                return Ok(());
            }
            Err(DmError::Engine { status: Some(404), .. }) if attempt + 1 < VERIFY_ATTEMPTS => {
                warn!(
                    image,
                    attempt = attempt + 1,
                    "Image not yet in engine store, retrying"
                );
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
            Err(e) => return Err(e),
        }
    }
    Err(DmError::engine(
        None,
        format!("Image {image} pull stream ended but image never appeared in the store"),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layer(status: &str, current: u64, total: u64) -> LayerState {
        LayerState {
            status: status.into(),
            current,
            total,
        }
    }

    #[test]
    fn test_snapshot_summary_downloading() {
        let mut layers = HashMap::new();
        layers.insert("l1".to_string(), layer("Downloading", 50, 100));
        layers.insert("l2".to_string(), layer("Pull complete", 100, 100));
        let snap = build_snapshot(&layers, 75, 2.5);
        assert!(snap.summary.starts_with("Downloading 1 of 2 layers (75%)"));
        assert!(snap.summary.contains("2.5 MB/s"));
    }

    #[test]
    fn test_snapshot_summary_cached_complete() {
        let mut layers = HashMap::new();
        layers.insert("l1".to_string(), layer("Already exists", 0, 0));
        layers.insert("l2".to_string(), layer("Pull complete", 10, 10));
        let snap = build_snapshot(&layers, 100, 0.0);
        assert!(snap.summary.starts_with("Pull complete"));
        assert!(snap.summary.contains("1 cached"));
    }

    #[test]
    fn test_snapshot_trims_layer_list() {
        let mut layers = HashMap::new();
        for i in 0..30 {
            layers.insert(format!("l{i}"), layer("Downloading", 1, 10));
        }
        let snap = build_snapshot(&layers, 10, 0.0);
        assert_eq!(snap.layers.len(), 20);
        assert_eq!(snap.remaining_layers, 10);
        assert_eq!(snap.total_layers, 30);
    }

    #[test]
    fn test_manifest_only_summary() {
        let layers = HashMap::new();
        let snap = build_snapshot(&layers, 100, 0.0);
        assert_eq!(snap.summary, "Pull complete (manifest only)");
    }
}
