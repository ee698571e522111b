// Copyright (C) 2024 SentryShot Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! RFC 8216 + low-latency HLS playlist generation (§4.B, §6).

use std::fmt::Write as _;

use super::{Segment, DEFAULT_PART_TARGET_MS};

/// Renders the live media playlist for `segments` (oldest first, at most the
/// ring-buffer's worth), with the low-latency preload hint pointing at the
/// next part of `segments.last()`.
pub fn render_media_playlist(segments: &[std::sync::Arc<Segment>], target_duration_secs: u32) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "#EXTM3U");
    let _ = writeln!(out, "#EXT-X-VERSION:9");
    let _ = writeln!(out, "#EXT-X-TARGETDURATION:{target_duration_secs}");
    let _ = writeln!(
        out,
        "#EXT-X-PART-INF:PART-TARGET={:.3}",
        DEFAULT_PART_TARGET_MS as f64 / 1000.0
    );
    let media_sequence = segments.first().map(|s| s.id).unwrap_or(0);
    let _ = writeln!(out, "#EXT-X-MEDIA-SEQUENCE:{media_sequence}");

    for (i, segment) in segments.iter().enumerate() {
        let is_last = i + 1 == segments.len();
        for part in &segment.parts {
            let duration_secs = part_duration_secs(segment, part);
            let _ = writeln!(
                out,
                "#EXT-X-PART:DURATION={duration_secs:.3},URI=\"part{}.m4s\"{}",
                part.id,
                if part.is_independent { ",INDEPENDENT=YES" } else { "" }
            );
        }
        let duration_secs = segment.duration_ns() as f64 / 1_000_000_000.0;
        let _ = writeln!(out, "#EXTINF:{duration_secs:.3},");
        let _ = writeln!(out, "segment{}.m4s", segment.id);
        if is_last {
            if let Some(next_part) = segment.parts.last() {
                let _ = writeln!(
                    out,
                    "#EXT-X-PRELOAD-HINT:TYPE=PART,URI=\"part{}.m4s\"",
                    next_part.id + 1
                );
            }
        }
    }
    out
}

fn part_duration_secs(segment: &Segment, part: &super::Part) -> f64 {
    let samples: Vec<i64> = part
        .video
        .iter()
        .chain(part.audio.iter())
        .map(|s| s.pts)
        .collect();
    let (min, max) = match (samples.iter().min(), samples.iter().max()) {
        (Some(min), Some(max)) => (*min, *max),
        _ => return 0.0,
    };
    let span = (max - min).max(1) as f64 / 1_000_000_000.0;
    let _ = segment;
    span
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hls::{MuxedSample, Part};
    use bytes::Bytes;
    use std::sync::Arc;

    fn sample(pts: i64) -> MuxedSample {
        MuxedSample {
            pts,
            dts: pts,
            random_access: true,
            payload: Bytes::from_static(&[0]),
        }
    }

    #[test]
    fn media_sequence_matches_oldest_segment_id() {
        let seg = Arc::new(Segment {
            id: 7,
            parts: vec![Part {
                id: 1,
                is_independent: true,
                video: vec![sample(0), sample(100_000_000)],
                audio: vec![],
                mp4: Bytes::new(),
            }],
            start_pts: 0,
            end_pts: 2_000_000_000,
        });
        let playlist = render_media_playlist(&[seg], 2);
        assert!(playlist.contains("#EXT-X-MEDIA-SEQUENCE:7"));
        assert!(playlist.contains("#EXT-X-VERSION:9"));
        assert!(playlist.contains("#EXT-X-PRELOAD-HINT"));
    }
}
