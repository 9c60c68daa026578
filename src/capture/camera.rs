//! GStreamer camera capture
//!
//! Builds `source -> convert -> scale -> rate -> caps -> encoder -> payloader -> appsink`
//! and pushes every RTP buffer from the appsink into the broadcast feed.

use super::{MediaSource, RTP_CHANNEL_CAPACITY};
use crate::config::{CaptureConfig, CaptureSourceKind, VideoCodec};
use crate::webrtc::SessionError;
use bytes::Bytes;
use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use tokio::sync::broadcast;

/// appsink poll interval of the pull thread
const PULL_TIMEOUT_MS: u64 = 100;

struct Running {
    pipeline: gst::Pipeline,
    sender: broadcast::Sender<Bytes>,
    stop: Arc<AtomicBool>,
    pull_thread: Option<thread::JoinHandle<()>>,
}

/// Camera or test-pattern source encoded by GStreamer
pub struct GstCameraSource {
    name: String,
    config: CaptureConfig,
    codec: VideoCodec,
    running: Mutex<Option<Running>>,
}

impl GstCameraSource {
    pub fn new(config: CaptureConfig, codec: VideoCodec) -> Self {
        let name = match config.source {
            CaptureSourceKind::TestPattern => "gst-test-pattern".to_string(),
            _ => format!("gst-camera({})", config.device),
        };
        Self {
            name,
            config,
            codec,
            running: Mutex::new(None),
        }
    }

    fn build_pipeline(&self) -> Result<(gst::Pipeline, gst_app::AppSink), SessionError> {
        gst::init().map_err(|e| init_error("initialize GStreamer", e))?;

        let pipeline = gst::Pipeline::new();
        let (src_name, encoder_name, payloader_name) = element_names(self.config.source, self.codec);

        let src = match self.config.source {
            CaptureSourceKind::TestPattern => gst::ElementFactory::make(src_name)
                .property("is-live", true)
                .build(),
            _ => gst::ElementFactory::make(src_name)
                .property("device", self.config.device.as_str())
                .build(),
        }
        .map_err(|e| init_error(&format!("create {}", src_name), e))?;

        let convert = make("videoconvert")?;
        let scale = make("videoscale")?;
        let rate = make("videorate")?;

        let caps = format!(
            "video/x-raw,width={},height={},framerate={}/1",
            self.config.width, self.config.height, self.config.framerate
        )
        .parse::<gst::Caps>()
        .map_err(|e| init_error("parse capture caps", e))?;
        let capsfilter = gst::ElementFactory::make("capsfilter")
            .property("caps", &caps)
            .build()
            .map_err(|e| init_error("create capsfilter", e))?;

        let encoder = self.create_encoder(encoder_name)?;

        let mut payloader = gst::ElementFactory::make(payloader_name).property("pt", self.codec.rtp_payload_type() as u32);
        if self.codec == VideoCodec::H264 {
            payloader = payloader.property("config-interval", 1i32);
        }
        let payloader = payloader.build().map_err(|e| init_error(&format!("create {}", payloader_name), e))?;

        let appsink = gst_app::AppSink::builder()
            .name("rtpsink")
            .sync(false)
            .max_buffers(64)
            .drop(true)
            .build();

        pipeline
            .add_many([&src, &convert, &scale, &rate, &capsfilter, &encoder, &payloader, appsink.upcast_ref()])
            .map_err(|e| init_error("add elements", e))?;
        gst::Element::link_many([&src, &convert, &scale, &rate, &capsfilter, &encoder, &payloader, appsink.upcast_ref()])
            .map_err(|e| init_error("link elements", e))?;

        info!(
            "Capture pipeline: {} -> {} -> {} ({}x{}@{})",
            src_name, encoder_name, payloader_name, self.config.width, self.config.height, self.config.framerate
        );
        Ok((pipeline, appsink))
    }

    fn create_encoder(&self, name: &'static str) -> Result<gst::Element, SessionError> {
        let kbps = self.config.bitrate_kbps;
        let keyframe_interval = self.config.framerate.max(1) * 2;
        let builder = match self.codec {
            VideoCodec::H264 => gst::ElementFactory::make(name)
                .property("bitrate", kbps)
                .property("key-int-max", keyframe_interval)
                .property_from_str("tune", "zerolatency")
                .property_from_str("speed-preset", "ultrafast"),
            VideoCodec::VP8 | VideoCodec::VP9 => gst::ElementFactory::make(name)
                .property("target-bitrate", (kbps * 1000) as i32)
                .property("deadline", 1i64)
                .property("keyframe-max-dist", keyframe_interval as i32),
        };
        builder.build().map_err(|e| init_error(&format!("create {}", name), e))
    }
}

impl MediaSource for GstCameraSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn codec(&self) -> VideoCodec {
        self.codec
    }

    fn start_capture(&self) -> Result<broadcast::Receiver<Bytes>, SessionError> {
        let mut running = self.running.lock();
        if let Some(ref r) = *running {
            return Ok(r.sender.subscribe());
        }

        let (pipeline, appsink) = self.build_pipeline()?;
        if let Err(e) = pipeline.set_state(gst::State::Playing) {
            let _ = pipeline.set_state(gst::State::Null);
            return Err(init_error("start capture pipeline", e));
        }

        let (sender, receiver) = broadcast::channel(RTP_CHANNEL_CAPACITY);
        let stop = Arc::new(AtomicBool::new(false));
        let pull_thread = spawn_pull_thread(appsink, sender.clone(), stop.clone())
            .map_err(|e| {
                let _ = pipeline.set_state(gst::State::Null);
                init_error("spawn capture thread", e)
            })?;

        info!("{} capturing", self.name);
        *running = Some(Running {
            pipeline,
            sender,
            stop,
            pull_thread: Some(pull_thread),
        });
        Ok(receiver)
    }

    fn stop_capture(&self) {
        let Some(mut r) = self.running.lock().take() else {
            return;
        };
        r.stop.store(true, Ordering::SeqCst);
        if let Err(e) = r.pipeline.set_state(gst::State::Null) {
            warn!("Failed to stop capture pipeline: {}", e);
        }
        if let Some(handle) = r.pull_thread.take() {
            if handle.join().is_err() {
                warn!("Capture pull thread panicked");
            }
        }
        info!("{} stopped", self.name);
    }

    fn is_capturing(&self) -> bool {
        self.running.lock().is_some()
    }
}

impl Drop for GstCameraSource {
    fn drop(&mut self) {
        self.stop_capture();
    }
}

fn spawn_pull_thread(
    appsink: gst_app::AppSink,
    sender: broadcast::Sender<Bytes>,
    stop: Arc<AtomicBool>,
) -> std::io::Result<thread::JoinHandle<()>> {
    thread::Builder::new().name("camlink-capture".to_string()).spawn(move || {
        let mut packets: u64 = 0;
        while !stop.load(Ordering::SeqCst) {
            let Some(sample) = appsink.try_pull_sample(gst::ClockTime::from_mseconds(PULL_TIMEOUT_MS)) else {
                if appsink.is_eos() {
                    warn!("Capture pipeline reached end of stream");
                    break;
                }
                continue;
            };
            let Some(buffer) = sample.buffer() else {
                continue;
            };
            let Ok(map) = buffer.map_readable() else {
                continue;
            };

            packets += 1;
            if packets == 1 {
                debug!("First RTP packet from capture pipeline ({} bytes)", map.len());
            }
            let _ = sender.send(Bytes::copy_from_slice(map.as_slice()));
        }
    })
}

/// Source, encoder and payloader element names for a capture setup
fn element_names(source: CaptureSourceKind, codec: VideoCodec) -> (&'static str, &'static str, &'static str) {
    let src = match source {
        CaptureSourceKind::TestPattern => "videotestsrc",
        _ => "v4l2src",
    };
    let (encoder, payloader) = match codec {
        VideoCodec::H264 => ("x264enc", "rtph264pay"),
        VideoCodec::VP8 => ("vp8enc", "rtpvp8pay"),
        VideoCodec::VP9 => ("vp9enc", "rtpvp9pay"),
    };
    (src, encoder, payloader)
}

fn make(name: &'static str) -> Result<gst::Element, SessionError> {
    gst::ElementFactory::make(name).build().map_err(|e| init_error(&format!("create {}", name), e))
}

fn init_error(what: &str, e: impl std::fmt::Display) -> SessionError {
    SessionError::ResourceInit(format!("Failed to {}: {}", what, e))
}
