//! Remote UI bridge: controller + perception over a TCP JSON-lines port.
//!
//! The bridge process owns the real window (capture, tap injection, the
//! detector and OCR engines); this client drives it synchronously. Remote
//! detection honors a hard deadline of twice the Waiter interval: a timed-out
//! detect returns an empty detection set, and only a long run of consecutive
//! timeouts is treated as an unreachable backend.

use std::cell::RefCell;
use std::io::{BufRead, BufReader, Write};
use std::net::TcpStream;
use std::rc::Rc;
use std::time::Duration;

use anyhow::Context;
use serde_json::{json, Value};
use tracing::warn;

use stride_bot_core::controller::{Controller, ControllerKind};
use stride_bot_core::geometry::BBox;
use stride_bot_core::perception::{Detection, FrameImage, Perception};

const MAX_CONSECUTIVE_TIMEOUTS: u32 = 20;

pub struct BridgeClient {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
}

impl BridgeClient {
    pub fn connect(addr: &str, read_timeout: Duration) -> anyhow::Result<Self> {
        let stream = TcpStream::connect(addr)
            .with_context(|| format!("connect bridge control port {addr}"))?;
        stream
            .set_read_timeout(Some(read_timeout))
            .context("set bridge read timeout")?;
        let writer = stream.try_clone().context("clone bridge stream")?;
        Ok(Self {
            reader: BufReader::new(stream),
            writer,
        })
    }

    fn request(&mut self, req: Value) -> anyhow::Result<Value> {
        let line = format!("{req}\n");
        self.writer
            .write_all(line.as_bytes())
            .context("bridge write")?;
        self.writer.flush().ok();

        let mut resp_line = String::new();
        let n = self.reader.read_line(&mut resp_line).context("bridge read")?;
        if n == 0 {
            anyhow::bail!("bridge connection closed");
        }
        let v: Value =
            serde_json::from_str(resp_line.trim()).context("invalid bridge json response")?;
        if v.get("ok").and_then(Value::as_bool) != Some(true) {
            anyhow::bail!("bridge request failed: {v}");
        }
        Ok(v)
    }
}

pub struct RemoteBridgeController {
    client: Rc<RefCell<BridgeClient>>,
}

impl RemoteBridgeController {
    pub fn new(client: Rc<RefCell<BridgeClient>>) -> Self {
        Self { client }
    }
}

impl Controller for RemoteBridgeController {
    fn capture(&mut self) -> anyhow::Result<FrameImage> {
        let v = self
            .client
            .borrow_mut()
            .request(json!({ "op": "capture" }))?;
        let frame = v
            .get("frame")
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("missing frame in capture response"))?;
        Ok(FrameImage {
            seq: frame.get("seq").and_then(Value::as_u64).unwrap_or(0),
            width: frame.get("width").and_then(Value::as_u64).unwrap_or(0) as u32,
            height: frame.get("height").and_then(Value::as_u64).unwrap_or(0) as u32,
        })
    }

    fn click(&mut self, x: f32, y: f32) -> anyhow::Result<()> {
        self.client
            .borrow_mut()
            .request(json!({ "op": "click", "x": x, "y": y }))?;
        Ok(())
    }

    fn scroll(&mut self, from: (f32, f32), dy: i32) -> anyhow::Result<()> {
        self.client
            .borrow_mut()
            .request(json!({ "op": "scroll", "x": from.0, "y": from.1, "dy": dy }))?;
        Ok(())
    }

    fn kind(&self) -> ControllerKind {
        ControllerKind::RemoteBridge
    }
}

pub struct RemotePerception {
    client: Rc<RefCell<BridgeClient>>,
    consecutive_timeouts: u32,
}

impl RemotePerception {
    pub fn new(client: Rc<RefCell<BridgeClient>>) -> Self {
        Self {
            client,
            consecutive_timeouts: 0,
        }
    }

    fn is_timeout(err: &anyhow::Error) -> bool {
        err.downcast_ref::<std::io::Error>()
            .map(|io| {
                matches!(
                    io.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                )
            })
            .unwrap_or(false)
    }
}

impl Perception for RemotePerception {
    fn detect(&mut self, frame: &FrameImage) -> anyhow::Result<Vec<Detection>> {
        let resp = self
            .client
            .borrow_mut()
            .request(json!({ "op": "detect", "seq": frame.seq }));
        match resp {
            Ok(v) => {
                self.consecutive_timeouts = 0;
                let dets = v
                    .get("detections")
                    .cloned()
                    .ok_or_else(|| anyhow::anyhow!("missing detections in response"))?;
                serde_json::from_value(dets).context("decode detections")
            }
            Err(err) if Self::is_timeout(&err) => {
                self.consecutive_timeouts += 1;
                if self.consecutive_timeouts >= MAX_CONSECUTIVE_TIMEOUTS {
                    return Err(err.context("detection backend unreachable"));
                }
                warn!(
                    "[agent] detect deadline exceeded ({}x); treating as empty set",
                    self.consecutive_timeouts
                );
                Ok(Vec::new())
            }
            Err(err) => Err(err),
        }
    }

    fn ocr(&mut self, frame: &FrameImage, roi: BBox) -> anyhow::Result<Vec<(String, f32)>> {
        let resp = self.client.borrow_mut().request(json!({
            "op": "ocr",
            "seq": frame.seq,
            "roi": [roi.x1, roi.y1, roi.x2, roi.y2],
        }));
        match resp {
            Ok(v) => {
                let tokens = v.get("tokens").cloned().unwrap_or(Value::Array(vec![]));
                serde_json::from_value(tokens).context("decode ocr tokens")
            }
            Err(err) if Self::is_timeout(&err) => Ok(Vec::new()),
            Err(err) => Err(err),
        }
    }
}
