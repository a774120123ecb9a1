// Naive player association across frames
//
// Greedy IoU matching against the previous boxes. Ids are only as stable as
// the detector's boxes are: an occlusion or a missed detection longer than
// `max_missed_frames` gives the player a new id.

use crate::config::TrackingConfig;
use crate::pipeline::geometry::iou;
use crate::pipeline::types::{BBox, KeypointSet};
use std::collections::VecDeque;

/// One scored pose in a player's history
#[derive(Debug, Clone)]
pub struct PoseSample {
    pub frame_index: usize,
    pub keypoints: KeypointSet,
    pub body_height: f32,
}

/// Bounded window of recent poses for one player
#[derive(Debug, Clone, Default)]
pub struct PoseHistory {
    samples: VecDeque<PoseSample>,
    capacity: usize,
}

impl PoseHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, sample: PoseSample) {
        if self.capacity == 0 {
            return;
        }
        while self.samples.len() >= self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    pub fn iter(&self) -> impl Iterator<Item = &PoseSample> {
        self.samples.iter()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct Track {
    pub id: u32,
    pub bbox: BBox,
    pub last_seen: usize,
    pub history: PoseHistory,
}

pub struct PlayerTracker {
    config: TrackingConfig,
    tracks: Vec<Track>,
    next_id: u32,
}

impl PlayerTracker {
    pub fn new(config: TrackingConfig) -> Self {
        Self {
            config,
            tracks: Vec::new(),
            next_id: 1,
        }
    }

    /// Assign a track id to every box of `frame_index`, in input order.
    pub fn associate(&mut self, frame_index: usize, boxes: &[BBox]) -> Vec<u32> {
        let max_missed = self.config.max_missed_frames;
        self.tracks
            .retain(|t| frame_index.saturating_sub(t.last_seen) <= max_missed + 1);

        // All candidate pairs above the threshold, best overlap first
        let mut pairs: Vec<(f32, usize, usize)> = Vec::new();
        for (bi, b) in boxes.iter().enumerate() {
            for (ti, t) in self.tracks.iter().enumerate() {
                let overlap = iou(b, &t.bbox);
                if overlap >= self.config.iou_threshold {
                    pairs.push((overlap, bi, ti));
                }
            }
        }
        pairs.sort_by(|a, b| b.0.total_cmp(&a.0));

        let mut assigned: Vec<Option<u32>> = vec![None; boxes.len()];
        let mut track_taken = vec![false; self.tracks.len()];
        for (_, bi, ti) in pairs {
            if assigned[bi].is_some() || track_taken[ti] {
                continue;
            }
            track_taken[ti] = true;
            let track = &mut self.tracks[ti];
            track.bbox = boxes[bi];
            track.last_seen = frame_index;
            assigned[bi] = Some(track.id);
        }

        assigned
            .into_iter()
            .enumerate()
            .map(|(bi, id)| match id {
                Some(id) => id,
                None => {
                    let id = self.next_id;
                    self.next_id += 1;
                    self.tracks.push(Track {
                        id,
                        bbox: boxes[bi],
                        last_seen: frame_index,
                        history: PoseHistory::new(self.config.history_frames),
                    });
                    id
                }
            })
            .collect()
    }

    pub fn history(&self, id: u32) -> Option<&PoseHistory> {
        self.tracks.iter().find(|t| t.id == id).map(|t| &t.history)
    }

    pub fn record_pose(&mut self, id: u32, sample: PoseSample) {
        if let Some(track) = self.tracks.iter_mut().find(|t| t.id == id) {
            track.history.push(sample);
        }
    }
}
