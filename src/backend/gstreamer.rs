use super::{BackendKind, CaptureBackend, CaptureParams, CaptureSession};
use crate::error::OpenError;

/// V4L2 capture through a GStreamer pipeline ending in an appsink
pub struct GstreamerBackend;

impl GstreamerBackend {
    pub fn new() -> Self {
        Self
    }

    /// Whether this build carries GStreamer support at all
    pub fn compiled_in() -> bool {
        cfg!(all(target_os = "linux", feature = "camera"))
    }

    /// Pipeline description for one camera index
    pub fn pipeline_description(params: &CaptureParams) -> String {
        format!(
            "v4l2src device=/dev/video{} do-timestamp=true ! \
             videoconvert ! videoscale ! \
             video/x-raw,format=RGB,width={},height={} ! \
             appsink name=sink sync=false max-buffers=1 drop=true enable-last-sample=false emit-signals=false",
            params.index, params.width, params.height
        )
    }
}

impl Default for GstreamerBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl CaptureBackend for GstreamerBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Gstreamer
    }

    #[cfg(all(target_os = "linux", feature = "camera"))]
    fn open(&self, params: &CaptureParams) -> Result<Box<dyn CaptureSession>, OpenError> {
        Ok(Box::new(imp::GstreamerSession::open(params)?))
    }

    #[cfg(not(all(target_os = "linux", feature = "camera")))]
    fn open(&self, _params: &CaptureParams) -> Result<Box<dyn CaptureSession>, OpenError> {
        Err(OpenError::BackendUnavailable {
            details: "built without GStreamer support".to_string(),
        })
    }
}

#[cfg(all(target_os = "linux", feature = "camera"))]
mod imp {
    use super::GstreamerBackend;
    use crate::backend::{CaptureParams, CaptureSession};
    use crate::error::{OpenError, ReadError};
    use crate::frame::{Frame, PixelFormat};
    use gstreamer::prelude::*;
    use gstreamer::Pipeline;
    use gstreamer_app::AppSink;
    use gstreamer_video::VideoInfo;
    use std::time::{Duration, SystemTime};
    use tracing::{debug, info, trace, warn};

    const PREROLL_TIMEOUT_SECS: u64 = 5;

    pub struct GstreamerSession {
        params: CaptureParams,
        pipeline: Pipeline,
        appsink: AppSink,
        sequence: u64,
        closed: bool,
    }

    impl GstreamerSession {
        pub fn open(params: &CaptureParams) -> Result<Self, OpenError> {
            gstreamer::init().map_err(|e| OpenError::BackendUnavailable {
                details: format!("GStreamer init failed: {}", e),
            })?;

            let description = GstreamerBackend::pipeline_description(params);
            info!("Creating GStreamer pipeline: {}", description);

            let pipeline = gstreamer::parse::launch(&description)
                .map_err(|e| OpenError::BackendUnavailable {
                    details: format!("Failed to create pipeline: {}", e),
                })?
                .downcast::<Pipeline>()
                .map_err(|_| OpenError::BackendUnavailable {
                    details: "Failed to downcast to Pipeline".to_string(),
                })?;

            let appsink = pipeline
                .by_name("sink")
                .and_then(|element| element.downcast::<AppSink>().ok())
                .ok_or_else(|| OpenError::BackendUnavailable {
                    details: "pipeline has no appsink".to_string(),
                })?;

            let session = GstreamerSession {
                params: *params,
                pipeline,
                appsink,
                sequence: 0,
                closed: false,
            };

            if let Err(e) = session.pipeline.set_state(gstreamer::State::Playing) {
                let details = session.bus_error().unwrap_or_else(|| e.to_string());
                return Err(session.open_error(details));
            }

            let (result, _, _) = session
                .pipeline
                .state(gstreamer::ClockTime::from_seconds(PREROLL_TIMEOUT_SECS));
            if let Err(e) = result {
                let details = session.bus_error().unwrap_or_else(|| e.to_string());
                return Err(session.open_error(details));
            }

            debug!("GStreamer pipeline for /dev/video{} is playing", params.index);
            Ok(session)
        }

        fn open_error(&self, details: String) -> OpenError {
            // Session drops here and tears the pipeline down
            if details.contains("not-negotiated") || details.contains("not negotiated") {
                OpenError::UnsupportedMode {
                    index: self.params.index,
                    width: self.params.width,
                    height: self.params.height,
                    details,
                }
            } else {
                OpenError::unavailable(self.params.index, details)
            }
        }

        fn bus_error(&self) -> Option<String> {
            let bus = self.pipeline.bus()?;
            let message = bus.pop_filtered(&[gstreamer::MessageType::Error])?;
            match message.view() {
                gstreamer::MessageView::Error(err) => Some(format!(
                    "{} ({})",
                    err.error(),
                    err.debug().map(|d| d.to_string()).unwrap_or_default()
                )),
                _ => None,
            }
        }

        fn sample_to_frame(&mut self, sample: gstreamer::Sample) -> Result<Frame, ReadError> {
            let buffer = sample
                .buffer()
                .ok_or_else(|| ReadError::malformed("No buffer in sample"))?;
            let caps = sample
                .caps()
                .ok_or_else(|| ReadError::malformed("No caps in sample"))?;
            let video_info = VideoInfo::from_caps(caps)
                .map_err(|e| ReadError::malformed(format!("Failed to get video info: {}", e)))?;

            let width = video_info.width();
            let height = video_info.height();
            let stride = video_info.stride()[0] as usize;
            let row_bytes = width as usize * 3;

            let map = buffer
                .map_readable()
                .map_err(|e| ReadError::malformed(format!("Failed to map buffer: {}", e)))?;
            let bytes = map.as_slice();

            // videoconvert pads rows to 4-byte boundaries
            let data = if stride == row_bytes {
                bytes.to_vec()
            } else {
                let mut packed = Vec::with_capacity(row_bytes * height as usize);
                for row in bytes.chunks(stride).take(height as usize) {
                    let end = row_bytes.min(row.len());
                    packed.extend_from_slice(&row[..end]);
                }
                packed
            };

            let frame = Frame::new(
                self.sequence,
                SystemTime::now(),
                data,
                width,
                height,
                PixelFormat::Rgb24,
            );
            self.sequence += 1;
            trace!("Captured frame {} ({}x{})", frame.id, width, height);
            frame.into_rgb()
        }
    }

    impl CaptureSession for GstreamerSession {
        fn read_frame(&mut self, timeout: Duration) -> Result<Frame, ReadError> {
            if self.closed {
                return Err(ReadError::disconnected("session closed"));
            }

            let wait = gstreamer::ClockTime::from_mseconds(timeout.as_millis() as u64);
            match self.appsink.try_pull_sample(wait) {
                Some(sample) => self.sample_to_frame(sample),
                None if self.appsink.is_eos() => Err(ReadError::disconnected(
                    self.bus_error()
                        .unwrap_or_else(|| "end of stream".to_string()),
                )),
                None => match self.bus_error() {
                    Some(details) => Err(ReadError::disconnected(details)),
                    None => Err(ReadError::Timeout {
                        timeout_ms: timeout.as_millis() as u64,
                    }),
                },
            }
        }

        fn is_alive(&self) -> bool {
            !self.closed
                && !self.appsink.is_eos()
                && self.pipeline.current_state() == gstreamer::State::Playing
        }

        fn close(&mut self) {
            if self.closed {
                return;
            }
            self.closed = true;
            if let Err(e) = self.pipeline.set_state(gstreamer::State::Null) {
                warn!(
                    "Failed to stop pipeline for /dev/video{}: {}",
                    self.params.index, e
                );
            }
            debug!("GStreamer session for /dev/video{} closed", self.params.index);
        }
    }

    impl Drop for GstreamerSession {
        fn drop(&mut self) {
            self.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pipeline_description() {
        let description = GstreamerBackend::pipeline_description(&CaptureParams {
            index: 2,
            width: 640,
            height: 480,
            fps: 10,
        });
        assert!(description.starts_with("v4l2src device=/dev/video2"));
        assert!(description.contains("format=RGB,width=640,height=480"));
        assert!(description.contains("appsink name=sink"));
    }

    #[cfg(not(all(target_os = "linux", feature = "camera")))]
    #[test]
    fn test_unavailable_without_feature() {
        let result = GstreamerBackend::new().open(&CaptureParams {
            index: 0,
            width: 640,
            height: 480,
            fps: 10,
        });
        assert!(matches!(result, Err(OpenError::BackendUnavailable { .. })));
    }
}
