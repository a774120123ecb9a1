use crate::config::RiskConfig;
use crate::pipeline::types::{FrameRecord, PlayerStatus, Roster};
use crate::run_artifacts::{
    PlayerStats, RiskBand, RiskRow, DETECTIONS_FILE, RISK_CSV_FILE, STATS_FILE,
};
use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

fn round1(v: f32) -> f32 {
    (v * 10.0).round() / 10.0
}

/// Per-player summary over the whole video, keyed by track id.
pub fn summarize_players(
    records: &[FrameRecord],
    roster: &Roster,
    risk: &RiskConfig,
) -> BTreeMap<u32, PlayerStats> {
    struct Acc {
        seen: usize,
        scored: usize,
        flagged: usize,
        sum: f64,
        peak: f32,
        last: Option<f32>,
    }

    let mut acc: BTreeMap<u32, Acc> = BTreeMap::new();
    for record in records {
        for player in &record.players {
            let a = acc.entry(player.track_id).or_insert(Acc {
                seen: 0,
                scored: 0,
                flagged: 0,
                sum: 0.0,
                peak: 0.0,
                last: None,
            });
            a.seen += 1;
            if let Some(score) = player.risk {
                a.scored += 1;
                a.sum += score.pct as f64;
                a.peak = a.peak.max(score.pct);
                a.last = Some(score.pct);
                if score.flagged {
                    a.flagged += 1;
                }
            }
        }
    }

    acc.into_iter()
        .map(|(id, a)| {
            let last = a.last.map(round1);
            let mean = (a.scored > 0).then(|| round1((a.sum / a.scored as f64) as f32));
            let peak = (a.scored > 0).then(|| round1(a.peak));
            let stats = PlayerStats {
                name: roster.name_for(id),
                frames_seen: a.seen,
                frames_scored: a.scored,
                last_risk_pct: last,
                peak_risk_pct: peak,
                mean_risk_pct: mean,
                flagged_frames: a.flagged,
                band: RiskBand::for_pct(last, risk.warn_threshold_pct, risk.flag_threshold_pct),
                alert: last.is_some_and(|p| p >= risk.alert_threshold_pct),
            };
            (id, stats)
        })
        .collect()
}

pub fn write_stats(path: &Path, stats: &BTreeMap<u32, PlayerStats>) -> Result<()> {
    let json = serde_json::to_string_pretty(stats)?;
    fs::write(path, json).with_context(|| format!("Failed to write {:?}", path))?;
    Ok(())
}

fn status_label(status: PlayerStatus) -> &'static str {
    match status {
        PlayerStatus::Scored => "scored",
        PlayerStatus::LowConfidence => "low_confidence",
        PlayerStatus::NoPose => "no_pose",
    }
}

pub fn write_risk_csv(path: &Path, records: &[FrameRecord], roster: &Roster) -> Result<()> {
    let mut writer =
        csv::Writer::from_path(path).with_context(|| format!("Failed to create {:?}", path))?;
    for record in records {
        for player in &record.players {
            let b = player.detection.bbox;
            writer.serialize(RiskRow {
                frame: record.index,
                timestamp_secs: record.timestamp_secs,
                player_id: player.track_id,
                name: roster.name_for(player.track_id),
                status: status_label(player.status).to_string(),
                risk_pct: player.risk.map(|r| round1(r.pct)),
                flagged: player.risk.is_some_and(|r| r.flagged),
                x: b.x,
                y: b.y,
                w: b.w,
                h: b.h,
            })?;
        }
    }
    writer.flush()?;
    Ok(())
}

/// Write stats.json, detections.json and risk.csv into a run directory.
pub fn write_run_artifacts(
    output_dir: &Path,
    records: &[FrameRecord],
    stats: &BTreeMap<u32, PlayerStats>,
    roster: &Roster,
) -> Result<()> {
    write_stats(&output_dir.join(STATS_FILE), stats)?;

    let detections = serde_json::to_string(records)?;
    fs::write(output_dir.join(DETECTIONS_FILE), detections)?;

    write_risk_csv(&output_dir.join(RISK_CSV_FILE), records, roster)?;

    tracing::info!(
        "Wrote artifacts for {} frames, {} players to {:?}",
        records.len(),
        stats.len(),
        output_dir
    );
    Ok(())
}
