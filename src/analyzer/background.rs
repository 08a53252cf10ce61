use crate::config::MotionConfig;
use image::{GrayImage, Luma};
use tracing::{info, warn};

/// Mask value for foreground pixels
pub const FOREGROUND: u8 = 255;
/// Mask value for pixels classified as shadow
pub const SHADOW: u8 = 127;

const INITIAL_VARIANCE: f32 = 15.0;
const MIN_VARIANCE: f32 = 4.0;
const MAX_VARIANCE: f32 = 75.0;
/// Darkest shadow still treated as shadow, as a fraction of the background
const SHADOW_RATIO: f32 = 0.5;

/// Adaptive per-pixel Gaussian background.
///
/// Each pixel keeps a running mean and variance. A pixel whose squared
/// distance from the mean exceeds `var_threshold` times its variance is
/// foreground. The learning rate starts fast and settles at `1 / history`.
#[derive(Debug, Clone)]
pub struct BackgroundModel {
    width: u32,
    height: u32,
    mean: Vec<f32>,
    variance: Vec<f32>,
    frames_seen: u32,
    history: u32,
    var_threshold: f32,
    detect_shadows: bool,
}

impl BackgroundModel {
    pub fn new(history: u32, var_threshold: f32, detect_shadows: bool) -> Self {
        Self {
            width: 0,
            height: 0,
            mean: Vec::new(),
            variance: Vec::new(),
            frames_seen: 0,
            history: history.max(1),
            var_threshold,
            detect_shadows,
        }
    }

    pub fn from_config(config: &MotionConfig) -> Self {
        Self::new(config.history, config.sensitivity, config.detect_shadows)
    }

    pub fn frames_seen(&self) -> u32 {
        self.frames_seen
    }

    fn reset_to(&mut self, frame: &GrayImage) {
        let (width, height) = frame.dimensions();
        self.width = width;
        self.height = height;
        self.mean = frame.pixels().map(|p| p[0] as f32).collect();
        self.variance = vec![INITIAL_VARIANCE; self.mean.len()];
        self.frames_seen = 1;
    }

    /// Classify `frame` against the model, then learn from it.
    ///
    /// The first frame (or the first after a resolution change) seeds the
    /// model and yields an empty mask.
    pub fn apply(&mut self, frame: &GrayImage) -> GrayImage {
        let (width, height) = frame.dimensions();
        let mut mask = GrayImage::new(width, height);

        if self.frames_seen == 0 {
            info!("Initializing background model at {}x{}", width, height);
            self.reset_to(frame);
            return mask;
        }
        if (width, height) != (self.width, self.height) {
            warn!(
                "Frame size changed from {}x{} to {}x{}, reseeding background model",
                self.width, self.height, width, height
            );
            self.reset_to(frame);
            return mask;
        }

        self.frames_seen = self.frames_seen.saturating_add(1);
        let alpha = 1.0 / (2 * self.frames_seen).min(self.history) as f32;

        for ((pixel, out), (mean, variance)) in frame
            .pixels()
            .zip(mask.pixels_mut())
            .zip(self.mean.iter_mut().zip(self.variance.iter_mut()))
        {
            let value = pixel[0] as f32;
            let diff = value - *mean;
            let dist2 = diff * diff;

            if dist2 > self.var_threshold * *variance {
                let shadow = self.detect_shadows
                    && *mean > 0.0
                    && value < *mean
                    && value / *mean >= SHADOW_RATIO;
                *out = Luma([if shadow { SHADOW } else { FOREGROUND }]);
            }

            *mean += alpha * diff;
            *variance = (*variance + alpha * (dist2 - *variance)).clamp(MIN_VARIANCE, MAX_VARIANCE);
        }

        mask
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flat(width: u32, height: u32, value: u8) -> GrayImage {
        GrayImage::from_pixel(width, height, Luma([value]))
    }

    fn with_block(mut image: GrayImage, x0: u32, y0: u32, size: u32, value: u8) -> GrayImage {
        for y in y0..y0 + size {
            for x in x0..x0 + size {
                image.put_pixel(x, y, Luma([value]));
            }
        }
        image
    }

    fn count(mask: &GrayImage, value: u8) -> usize {
        mask.pixels().filter(|p| p[0] == value).count()
    }

    #[test]
    fn test_first_frame_seeds_model() {
        let mut model = BackgroundModel::new(500, 16.0, true);
        let mask = model.apply(&flat(20, 10, 200));
        assert_eq!(count(&mask, 0), 200);
        assert_eq!(model.frames_seen(), 1);
    }

    #[test]
    fn test_static_scene_stays_background() {
        let mut model = BackgroundModel::new(500, 16.0, true);
        for _ in 0..10 {
            let mask = model.apply(&flat(16, 16, 90));
            assert_eq!(count(&mask, FOREGROUND), 0);
        }
    }

    #[test]
    fn test_bright_object_is_foreground() {
        let mut model = BackgroundModel::new(500, 16.0, true);
        for _ in 0..5 {
            model.apply(&flat(32, 32, 0));
        }
        let mask = model.apply(&with_block(flat(32, 32, 0), 8, 8, 10, 255));
        assert_eq!(count(&mask, FOREGROUND), 100);
    }

    #[test]
    fn test_darkening_classified_as_shadow() {
        let mut shadows = BackgroundModel::new(500, 16.0, true);
        let mut no_shadows = BackgroundModel::new(500, 16.0, false);
        for _ in 0..5 {
            shadows.apply(&flat(32, 32, 200));
            no_shadows.apply(&flat(32, 32, 200));
        }

        let darker = with_block(flat(32, 32, 200), 4, 4, 10, 130);
        let mask = shadows.apply(&darker);
        assert_eq!(count(&mask, SHADOW), 100);
        assert_eq!(count(&mask, FOREGROUND), 0);

        let mask = no_shadows.apply(&darker);
        assert_eq!(count(&mask, FOREGROUND), 100);
    }

    #[test]
    fn test_very_dark_object_is_not_shadow() {
        let mut model = BackgroundModel::new(500, 16.0, true);
        for _ in 0..5 {
            model.apply(&flat(32, 32, 200));
        }
        let mask = model.apply(&with_block(flat(32, 32, 200), 4, 4, 10, 20));
        assert_eq!(count(&mask, FOREGROUND), 100);
    }

    #[test]
    fn test_resolution_change_reseeds() {
        let mut model = BackgroundModel::new(500, 16.0, true);
        model.apply(&flat(16, 16, 10));
        model.apply(&flat(16, 16, 10));
        let mask = model.apply(&flat(24, 12, 250));
        assert_eq!(count(&mask, FOREGROUND), 0);
        assert_eq!(model.frames_seen(), 1);
    }
}
