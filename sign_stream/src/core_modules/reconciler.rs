// THEORY:
// The `reconciler` module decides which detection list is "current". Results
// arrive asynchronously, may be out of order, and the service may decline to run
// inference on a frame (`skipped`). The reconciler is therefore built to be
// correct given only the latest message, never assuming a send/result pairing.
//
// Key architectural principles:
// 1.  **Last-Known Cache**: the most recent non-empty list is remembered. A
//     skipped frame republishes it instead of flashing "no detections".
// 2.  **Errors Do Not Touch State**: an `error` field is forwarded as-is and the
//     displayed list stays exactly what it was.
// 3.  **Timeline Matching**: for uploaded video the service returns results for
//     a fixed set of frames. The reconciler keeps that timeline and, for any
//     playback time, selects the frame nearest to `round(t * fps)`. This is a
//     pure function of (timeline, time), so seeking re-evaluates it without
//     waiting for any message.

use crate::protocol::{Detection, DetectionPayload, FrameDetection, InboundResult};

/// Frame rate assumed when a timed result does not report one.
pub const DEFAULT_VIDEO_FPS: f64 = 30.0;

/// What the presentation layer should do after one inbound result.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconcileUpdate {
    /// The list to display. `None` means "leave the display as it is".
    pub detections: Option<Vec<Detection>>,
    pub image: Option<String>,
    pub sentence: Option<String>,
    /// Application-level error reported by the service.
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
struct Timeline {
    frames: Vec<FrameDetection>,
    fps: f64,
}

#[derive(Debug, Default)]
pub struct DetectionReconciler {
    cache: Vec<Detection>,
    displayed: Vec<Detection>,
    timeline: Option<Timeline>,
    playback_time: f64,
}

impl DetectionReconciler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn displayed(&self) -> &[Detection] {
        &self.displayed
    }

    pub fn cached(&self) -> &[Detection] {
        &self.cache
    }

    pub fn playback_time(&self) -> f64 {
        self.playback_time
    }

    /// Frame rate of the loaded timeline, if a timed result has been applied.
    pub fn timeline_fps(&self) -> Option<f64> {
        self.timeline.as_ref().map(|timeline| timeline.fps)
    }

    pub fn apply(&mut self, result: &InboundResult) -> ReconcileUpdate {
        if let Some(error) = &result.error {
            return ReconcileUpdate {
                error: Some(error.clone()),
                ..Default::default()
            };
        }

        let mut update = ReconcileUpdate {
            image: result.image.clone(),
            sentence: result.sentence.clone(),
            ..Default::default()
        };

        if result.skipped {
            self.displayed = self.cache.clone();
            update.detections = Some(self.cache.clone());
            return update;
        }

        let detections = match &result.detections {
            Some(DetectionPayload::Timed(frames)) => {
                let fps = result.fps.filter(|fps| *fps > 0.0).unwrap_or(DEFAULT_VIDEO_FPS);
                let matched = nearest_frame(frames, fps, self.playback_time)
                    .map(|frame| frame.detections.clone())
                    .unwrap_or_default();
                self.timeline = Some(Timeline {
                    frames: frames.clone(),
                    fps,
                });
                matched
            }
            Some(DetectionPayload::List(list)) => {
                self.timeline = None;
                list.clone()
            }
            Some(DetectionPayload::Single(detection)) => {
                self.timeline = None;
                vec![detection.clone()]
            }
            None => {
                self.timeline = None;
                Vec::new()
            }
        };

        update.detections = Some(self.publish(detections));
        update
    }

    /// Playback moved to `time` seconds. Returns the new list when a timeline is loaded.
    pub fn seek(&mut self, time: f64) -> Option<Vec<Detection>> {
        self.playback_time = time;
        let timeline = self.timeline.as_ref()?;
        let detections = nearest_frame(&timeline.frames, timeline.fps, time)
            .map(|frame| frame.detections.clone())
            .unwrap_or_default();
        Some(self.publish(detections))
    }

    /// Forgets everything; used when a stream stops.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    fn publish(&mut self, detections: Vec<Detection>) -> Vec<Detection> {
        if !detections.is_empty() {
            self.cache = detections.clone();
        }
        self.displayed = detections.clone();
        detections
    }
}

/// Frame index displayed at `time` seconds.
pub fn target_frame(time: f64, fps: f64) -> u64 {
    (time.max(0.0) * fps).round() as u64
}

/// The entry closest to the frame shown at `time`. Ties go to the earliest entry in list order.
pub fn nearest_frame(frames: &[FrameDetection], fps: f64, time: f64) -> Option<&FrameDetection> {
    let target = target_frame(time, fps);
    frames.iter().fold(None, |best, candidate| match best {
        Some(best) if best.frame_number.abs_diff(target) <= candidate.frame_number.abs_diff(target) => Some(best),
        _ => Some(candidate),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(frame_number: u64, class_name: &str) -> FrameDetection {
        FrameDetection {
            frame_number,
            timestamp: frame_number as f64 / 30.0,
            detections: vec![Detection::new(class_name, 0.9)],
        }
    }

    fn timed(frames: Vec<FrameDetection>, fps: Option<f64>) -> InboundResult {
        InboundResult {
            detections: Some(DetectionPayload::Timed(frames)),
            fps,
            ..Default::default()
        }
    }

    fn live(detections: Vec<Detection>) -> InboundResult {
        InboundResult {
            detections: Some(DetectionPayload::List(detections)),
            ..Default::default()
        }
    }

    #[test]
    fn skipped_result_republishes_the_cache() {
        let mut reconciler = DetectionReconciler::new();
        reconciler.apply(&live(vec![Detection::new("A", 0.95)]));

        let update = reconciler.apply(&InboundResult {
            skipped: true,
            ..Default::default()
        });

        assert_eq!(update.detections, Some(vec![Detection::new("A", 0.95)]));
        assert_eq!(reconciler.displayed(), &[Detection::new("A", 0.95)]);
    }

    #[test]
    fn error_is_forwarded_without_touching_state() {
        let mut reconciler = DetectionReconciler::new();
        reconciler.apply(&live(vec![Detection::new("A", 0.95)]));

        let update = reconciler.apply(&InboundResult {
            error: Some("Invalid image data".into()),
            detections: Some(DetectionPayload::List(Vec::new())),
            ..Default::default()
        });

        assert_eq!(update.error.as_deref(), Some("Invalid image data"));
        assert_eq!(update.detections, None);
        assert_eq!(reconciler.displayed(), &[Detection::new("A", 0.95)]);
        assert_eq!(reconciler.cached(), &[Detection::new("A", 0.95)]);
    }

    #[test]
    fn empty_result_is_displayed_but_does_not_clear_the_cache() {
        let mut reconciler = DetectionReconciler::new();
        reconciler.apply(&live(vec![Detection::new("A", 0.95)]));

        let update = reconciler.apply(&live(Vec::new()));
        assert_eq!(update.detections, Some(Vec::new()));
        assert!(reconciler.displayed().is_empty());

        let update = reconciler.apply(&InboundResult {
            skipped: true,
            ..Default::default()
        });
        assert_eq!(update.detections, Some(vec![Detection::new("A", 0.95)]));
    }

    #[test]
    fn single_detection_is_wrapped() {
        let mut reconciler = DetectionReconciler::new();
        let update = reconciler.apply(&InboundResult {
            detections: Some(DetectionPayload::Single(Detection::new("yes", 0.7))),
            sentence: Some("Yes.".into()),
            ..Default::default()
        });
        assert_eq!(update.detections, Some(vec![Detection::new("yes", 0.7)]));
        assert_eq!(update.sentence.as_deref(), Some("Yes."));
    }

    #[test]
    fn nearest_frame_matches_worked_example() {
        let frames = vec![frame(0, "zero"), frame(30, "thirty"), frame(60, "sixty")];
        assert_eq!(target_frame(1.4, 30.0), 42);
        assert_eq!(nearest_frame(&frames, 30.0, 1.4).unwrap().frame_number, 30);
    }

    #[test]
    fn ties_go_to_the_first_entry_in_list_order() {
        let ascending = vec![frame(40, "forty"), frame(44, "forty-four")];
        assert_eq!(nearest_frame(&ascending, 30.0, 1.4).unwrap().frame_number, 40);

        let descending = vec![frame(44, "forty-four"), frame(40, "forty")];
        assert_eq!(nearest_frame(&descending, 30.0, 1.4).unwrap().frame_number, 44);
    }

    #[test]
    fn nearest_frame_of_empty_timeline_is_none() {
        assert!(nearest_frame(&[], 30.0, 3.0).is_none());
    }

    #[test]
    fn missing_fps_defaults_to_thirty() {
        let frames = vec![frame(0, "zero"), frame(30, "thirty"), frame(60, "sixty")];

        let mut reconciler = DetectionReconciler::new();
        reconciler.seek(1.9);
        let update = reconciler.apply(&timed(frames.clone(), None));
        assert_eq!(update.detections.unwrap()[0].class_name, "sixty");
        assert_eq!(reconciler.timeline_fps(), Some(DEFAULT_VIDEO_FPS));

        let mut reconciler = DetectionReconciler::new();
        reconciler.seek(1.9);
        let update = reconciler.apply(&timed(frames, Some(10.0)));
        assert_eq!(update.detections.unwrap()[0].class_name, "thirty");
    }

    #[test]
    fn seek_re_evaluates_against_the_loaded_timeline() {
        let frames = vec![frame(0, "zero"), frame(30, "thirty"), frame(60, "sixty")];
        let mut reconciler = DetectionReconciler::new();

        assert_eq!(reconciler.seek(1.0), None);

        let update = reconciler.apply(&timed(frames, Some(30.0)));
        assert_eq!(update.detections.unwrap()[0].class_name, "thirty");

        assert_eq!(reconciler.seek(0.2).unwrap()[0].class_name, "zero");
        assert_eq!(reconciler.seek(2.5).unwrap()[0].class_name, "sixty");
        assert_eq!(reconciler.seek(1.4).unwrap()[0].class_name, "thirty");
        assert_eq!(reconciler.displayed()[0].class_name, "thirty");
    }

    #[test]
    fn reset_clears_cache_and_timeline() {
        let mut reconciler = DetectionReconciler::new();
        reconciler.apply(&timed(vec![frame(0, "zero")], None));
        reconciler.reset();

        assert!(reconciler.cached().is_empty());
        assert!(reconciler.displayed().is_empty());
        assert_eq!(reconciler.seek(0.0), None);
    }
}
