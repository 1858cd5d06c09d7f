//! Image capture collaborator
//!
//! The planner treats the camera as a synchronous RPC with one request in
//! flight. A capture that does not finish in time must fail with
//! [`ImagerError::Timeout`] so the capture stage can retry it.

use image::{Rgb, RgbImage};
use stagekit_core::{thread_safe, ImagerError, Result, ThreadSafe};
use stagekit_settings::{ImagerSettings, PropertyMap};
use std::time::Duration;

/// One captured frame
pub type Frame = RgbImage;

/// Imager shared between the stages of one pipeline
pub type SharedImager = ThreadSafe<Box<dyn Imager>>;

/// Camera contract used by the capture pipeline
pub trait Imager: Send {
    /// Capture one frame, failing with [`ImagerError::Timeout`] after `timeout`
    fn get(&mut self, timeout: Duration) -> Result<Frame>;

    /// Size of delivered frames as (width, height)
    fn wh(&self) -> (u32, u32);

    /// Apply the given properties; unnamed properties keep their value
    fn set_properties(&mut self, properties: &PropertyMap) -> Result<()>;

    /// Current values of all properties
    fn get_properties(&self) -> Result<PropertyMap>;
}

/// Wrap an imager for sharing between stages
pub fn shared_imager(imager: impl Imager + 'static) -> SharedImager {
    let boxed: Box<dyn Imager> = Box::new(imager);
    thread_safe(boxed)
}

/// Produces the frame for capture number `n`
pub type FrameSource = Box<dyn FnMut(usize) -> Frame + Send>;

struct SimImagerState {
    width: u32,
    height: u32,
    properties: PropertyMap,
    captures: usize,
    pending_timeouts: usize,
    property_log: Vec<PropertyMap>,
    source: Option<FrameSource>,
}

/// In-process imager producing synthetic frames
#[derive(Clone)]
pub struct SimulatedImager {
    state: ThreadSafe<SimImagerState>,
}

impl SimulatedImager {
    /// Imager delivering `width` x `height` frames
    pub fn new(width: u32, height: u32) -> Self {
        let mut properties = PropertyMap::new();
        properties.insert("exposure_us".to_string(), serde_json::json!(10_000));
        properties.insert("gain".to_string(), serde_json::json!(1.0));
        Self {
            state: thread_safe(SimImagerState {
                width,
                height,
                properties,
                captures: 0,
                pending_timeouts: 0,
                property_log: Vec::new(),
                source: None,
            }),
        }
    }

    /// Imager matching the configured (scaled) sensor size
    pub fn from_settings(settings: &ImagerSettings) -> Self {
        let (width, height) = scaled_size(settings);
        Self::new(width, height)
    }

    /// Replace the synthetic pattern with frames from `source`
    pub fn with_source(self, source: FrameSource) -> Self {
        self.state.lock().source = Some(source);
        self
    }

    /// Make the next `count` captures time out
    pub fn fail_next_captures(&self, count: usize) {
        self.state.lock().pending_timeouts += count;
    }

    /// Frames delivered so far
    pub fn captures(&self) -> usize {
        self.state.lock().captures
    }

    /// Every property set applied, in order
    pub fn property_log(&self) -> Vec<PropertyMap> {
        self.state.lock().property_log.clone()
    }

    /// Current properties
    pub fn properties(&self) -> PropertyMap {
        self.state.lock().properties.clone()
    }
}

impl Imager for SimulatedImager {
    fn get(&mut self, timeout: Duration) -> Result<Frame> {
        let mut state = self.state.lock();
        if state.pending_timeouts > 0 {
            state.pending_timeouts -= 1;
            return Err(ImagerError::Timeout {
                timeout_ms: timeout.as_millis() as u64,
            }
            .into());
        }

        let n = state.captures;
        state.captures += 1;
        let (width, height) = (state.width, state.height);
        let frame = match state.source.as_mut() {
            Some(source) => source(n),
            None => RgbImage::from_fn(width, height, |x, y| {
                let v = ((x * 7 + y * 13 + n as u32 * 31) % 256) as u8;
                Rgb([v, v.wrapping_add(85), v.wrapping_add(170)])
            }),
        };
        Ok(frame)
    }

    fn wh(&self) -> (u32, u32) {
        let state = self.state.lock();
        (state.width, state.height)
    }

    fn set_properties(&mut self, properties: &PropertyMap) -> Result<()> {
        let mut state = self.state.lock();
        for (key, value) in properties {
            state.properties.insert(key.clone(), value.clone());
        }
        state.property_log.push(properties.clone());
        Ok(())
    }

    fn get_properties(&self) -> Result<PropertyMap> {
        Ok(self.state.lock().properties.clone())
    }
}

/// Sensor size after applying the configured scale
pub fn scaled_size(settings: &ImagerSettings) -> (u32, u32) {
    let scale = |v: u32| ((v as f64 * settings.scale).round() as u32).max(1);
    (scale(settings.width_px), scale(settings.height_px))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frames_have_requested_size() {
        let mut imager = SimulatedImager::new(32, 16);
        let frame = imager.get(Duration::from_millis(10)).unwrap();
        assert_eq!(frame.dimensions(), (32, 16));
        assert_eq!(imager.wh(), (32, 16));
        assert_eq!(imager.captures(), 1);
    }

    #[test]
    fn test_injected_timeouts_are_distinguishable() {
        let mut imager = SimulatedImager::new(8, 8);
        imager.fail_next_captures(1);
        let err = imager.get(Duration::from_millis(50)).unwrap_err();
        assert!(err.is_timeout());
        assert!(imager.get(Duration::from_millis(50)).is_ok());
    }

    #[test]
    fn test_properties_merge() {
        let mut imager = SimulatedImager::new(8, 8);
        let mut props = PropertyMap::new();
        props.insert("gain".to_string(), serde_json::json!(4.0));
        imager.set_properties(&props).unwrap();
        let current = imager.get_properties().unwrap();
        assert_eq!(current.get("gain"), Some(&serde_json::json!(4.0)));
        assert!(current.contains_key("exposure_us"));
    }

    #[test]
    fn test_scaled_size() {
        let settings = ImagerSettings {
            width_px: 640,
            height_px: 480,
            scale: 0.5,
            ..ImagerSettings::default()
        };
        assert_eq!(scaled_size(&settings), (320, 240));
    }
}
