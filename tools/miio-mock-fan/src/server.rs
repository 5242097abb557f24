//! Core mock fan server implementation.

use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use serde_json::{json, Value};

use crate::behavior::{DeviceBehavior, RequestKind};
use crate::codec;
use crate::config::DeviceConfig;

/// A mock miIO fan with pluggable behavior.
pub struct MockFanDevice<B: DeviceBehavior> {
    socket: UdpSocket,
    config: DeviceConfig,
    behavior: B,
    running: Arc<AtomicBool>,
    commands: Arc<Mutex<Vec<Value>>>,
    token: [u8; 16],
    key: [u8; 16],
    iv: [u8; 16],
    stamp: u32,
}

impl<B: DeviceBehavior> MockFanDevice<B> {
    /// Create a new mock device with the given configuration and behavior.
    pub fn new(config: DeviceConfig, behavior: B) -> io::Result<Self> {
        let token = codec::parse_token_hex(&config.token_hex)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "bad token hex"))?;
        let (key, iv) = codec::derive_key_iv(&token);

        let socket = UdpSocket::bind(config.bind_address)?;
        socket.set_read_timeout(Some(config.read_timeout))?;

        log::info!("mock fan listening on {}", socket.local_addr()?);

        Ok(Self {
            socket,
            stamp: config.stamp,
            config,
            behavior,
            running: Arc::new(AtomicBool::new(true)),
            commands: Arc::new(Mutex::new(Vec::new())),
            token,
            key,
            iv,
        })
    }

    /// The device's bound address.
    pub fn addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Start the device in a background thread and return a handle.
    pub fn spawn(self) -> DeviceHandle {
        let addr = self.socket.local_addr().expect("bound socket has an address");
        let running = Arc::clone(&self.running);
        let commands = Arc::clone(&self.commands);

        let handle = thread::spawn(move || {
            self.run();
        });

        DeviceHandle {
            addr,
            running,
            commands,
            handle: Some(handle),
        }
    }

    /// Run the device loop (blocking).
    pub fn run(mut self) {
        let mut buf = [0u8; 2048];

        while self.running.load(Ordering::SeqCst) {
            let (len, src) = match self.socket.recv_from(&mut buf) {
                Ok(result) => result,
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                    ) =>
                {
                    continue
                }
                Err(e) => {
                    log::error!("mock fan socket error: {}", e);
                    break;
                }
            };

            let frame = &buf[..len];
            self.behavior.on_frame_received(frame);

            if codec::is_hello(frame) {
                if self.behavior.should_respond(RequestKind::Hello) {
                    self.stamp = self.stamp.wrapping_add(1);
                    let reply = codec::hello_reply(self.config.device_id, self.stamp);
                    let _ = self.socket.send_to(&reply, src);
                }
                continue;
            }

            if len <= codec::HEADER_LEN {
                continue;
            }
            if !self.behavior.should_respond(RequestKind::Encrypted) {
                continue;
            }

            let decrypted = if codec::checksum_matches(frame, &self.token) {
                codec::decrypt_payload(&frame[codec::HEADER_LEN..], &self.key, &self.iv)
            } else {
                None
            };

            let Some(json_text) = decrypted else {
                // Real devices drop undecryptable frames; tests may opt into
                // a canned reply to exercise the client's decrypt path.
                if self.behavior.reply_when_undecryptable() {
                    self.send_json(src, &json!({"id": 0, "result": ["ok"]}));
                }
                continue;
            };

            let Ok(request) = serde_json::from_str::<Value>(&json_text) else {
                continue;
            };
            self.commands
                .lock()
                .expect("command log mutex")
                .push(request.clone());

            let id = request.get("id").and_then(Value::as_u64).unwrap_or(0);
            match request.get("method").and_then(Value::as_str) {
                Some("miIO.info") => {
                    let reply = self.info_reply(id);
                    self.send_json(src, &reply);
                }
                Some("set_properties") => {
                    self.send_json(src, &json!({"id": id, "result": ["ok"]}));
                }
                _ => {
                    self.send_json(
                        src,
                        &json!({"id": id, "error": {"code": -32601, "message": "unknown method"}}),
                    );
                }
            }
        }
    }

    fn info_reply(&self, id: u64) -> Value {
        let mut result = json!({
            "model": self.config.model,
            "fw_ver": self.config.fw_ver,
            "hw_ver": self.config.hw_ver,
        });
        if self.config.did != 0 {
            result["did"] = if self.config.did_as_string {
                Value::String(self.config.did.to_string())
            } else {
                Value::from(self.config.did)
            };
        }
        json!({"id": id, "result": result})
    }

    fn send_json(&self, dest: SocketAddr, body: &Value) {
        let text = body.to_string();
        let cipher = codec::encrypt_payload(&text, &self.key, &self.iv);
        let frame = codec::encode_frame(self.config.device_id, self.stamp, &self.token, &cipher);
        let _ = self.socket.send_to(&frame, dest);
    }
}

/// Handle to a running mock device.
pub struct DeviceHandle {
    /// The device's bound address.
    pub addr: SocketAddr,
    running: Arc<AtomicBool>,
    commands: Arc<Mutex<Vec<Value>>>,
    handle: Option<JoinHandle<()>>,
}

impl DeviceHandle {
    /// Number of decrypted commands received so far.
    pub fn command_count(&self) -> usize {
        self.commands.lock().expect("command log mutex").len()
    }

    /// Snapshot of all decrypted commands received so far.
    pub fn commands(&self) -> Vec<Value> {
        self.commands.lock().expect("command log mutex").clone()
    }

    /// Forget previously received commands.
    pub fn clear_commands(&self) {
        self.commands.lock().expect("command log mutex").clear();
    }

    /// Stop the device and join its thread.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for DeviceHandle {
    fn drop(&mut self) {
        self.stop();
    }
}
