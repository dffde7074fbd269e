//! Best-effort TCP bridge to an interactive viewer.
//!
//! The training loop calls [`ViewerBridge::service`] once per iteration.
//! The bridge polls for a connection without blocking; while a client is
//! connected and has paused training it stays in a request/response loop,
//! rendering preview frames on demand. Every I/O failure or malformed
//! message degrades to "disconnected" — the viewer can never abort
//! training.

use crate::optim::{Rasterizer, Trainer};
use crate::viewer::protocol::ViewerRequest;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};

/// Requests larger than this are treated as malformed.
const MAX_REQUEST_BYTES: u32 = 1 << 20;

/// Connection state after a poll, handled by explicit branches rather
/// than exceptions.
#[derive(Debug)]
pub enum PollResult {
    Connected,
    Disconnected,
    Error(std::io::Error),
}

struct Exchange {
    resume_training: bool,
    keep_alive: bool,
}

pub struct ViewerBridge {
    listener: TcpListener,
    stream: Option<TcpStream>,
    source_path: String,
}

impl ViewerBridge {
    pub fn bind(addr: &str, source_path: String) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        Ok(Self {
            listener,
            stream: None,
            source_path,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.listener.local_addr()
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    /// Non-blocking accept. An existing connection is kept; a pending one
    /// is promoted to blocking mode for the request/response exchanges.
    pub fn poll(&mut self) -> PollResult {
        if self.stream.is_some() {
            return PollResult::Connected;
        }
        match self.listener.accept() {
            Ok((stream, _)) => match stream.set_nonblocking(false) {
                Ok(()) => {
                    self.stream = Some(stream);
                    PollResult::Connected
                }
                Err(e) => PollResult::Error(e),
            },
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => PollResult::Disconnected,
            Err(e) => PollResult::Error(e),
        }
    }

    /// Service the viewer for one training iteration.
    ///
    /// Blocks on client requests only while the client has paused
    /// training; resumes as soon as a request carries `do_training`.
    pub fn service<R: Rasterizer>(&mut self, trainer: &Trainer<R>) {
        match self.poll() {
            PollResult::Connected => {}
            PollResult::Disconnected => return,
            PollResult::Error(_) => {
                self.stream = None;
                return;
            }
        }

        while self.stream.is_some() {
            match self.exchange(trainer) {
                Ok(outcome) => {
                    if !outcome.keep_alive {
                        self.stream = None;
                    }
                    if outcome.resume_training {
                        break;
                    }
                }
                Err(_) => {
                    self.stream = None;
                }
            }
        }
    }

    fn exchange<R: Rasterizer>(&mut self, trainer: &Trainer<R>) -> std::io::Result<Exchange> {
        let request = self.read_request()?;

        let (width, height, pixels) = match &request.camera {
            Some(params) => {
                let camera = params.to_camera();
                let sh_degree = if request.full_sh { trainer.sh_degree() } else { 0 };
                let frame = trainer.render_preview(
                    &camera,
                    request.scaling_modifier,
                    sh_degree,
                    request.apply_mask,
                );
                let mut bytes = Vec::with_capacity(frame.pixels.len() * 3);
                for p in &frame.pixels {
                    for &channel in &[p.x, p.y, p.z] {
                        // linear -> sRGB-ish gamma for display
                        let v = channel.clamp(0.0, 1.0).powf(1.0 / 2.2);
                        bytes.push((v * 255.0) as u8);
                    }
                }
                (frame.width, frame.height, bytes)
            }
            None => (0, 0, Vec::new()),
        };

        self.write_reply(width, height, &pixels)?;

        Ok(Exchange {
            resume_training: request.do_training,
            keep_alive: request.keep_alive,
        })
    }

    fn read_request(&mut self) -> std::io::Result<ViewerRequest> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| std::io::Error::from(std::io::ErrorKind::NotConnected))?;

        let mut len_buf = [0u8; 4];
        stream.read_exact(&mut len_buf)?;
        let len = u32::from_le_bytes(len_buf);
        if len == 0 || len > MAX_REQUEST_BYTES {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "request length out of bounds",
            ));
        }
        let mut payload = vec![0u8; len as usize];
        stream.read_exact(&mut payload)?;

        serde_json::from_slice(&payload)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    fn write_reply(&mut self, width: u32, height: u32, pixels: &[u8]) -> std::io::Result<()> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| std::io::Error::from(std::io::ErrorKind::NotConnected))?;

        stream.write_all(&width.to_le_bytes())?;
        stream.write_all(&height.to_le_bytes())?;
        stream.write_all(&(pixels.len() as u32).to_le_bytes())?;
        stream.write_all(pixels)?;
        let path_bytes = self.source_path.as_bytes();
        stream.write_all(&(path_bytes.len() as u32).to_le_bytes())?;
        stream.write_all(path_bytes)?;
        stream.flush()
    }
}
