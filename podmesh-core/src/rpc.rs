//! Typed request dispatch over the framing layer: a method registry, JSON
//! encode/decode, and a receive loop that dispatches decoded payloads to handlers.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::io::Write;
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;

use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::error::Error;
use crate::framing::FrameReader;

#[derive(serde::Serialize, serde::Deserialize)]
struct WireMessage {
    method: String,
    payload: Value,
}

type Handler = dyn Fn(&Arc<RpcChannel>, Box<dyn Any + Send>) + Send + Sync;
type Decoder = dyn Fn(Value) -> Result<Box<dyn Any + Send>, Error> + Send + Sync;

struct MethodEntry {
    payload_type: TypeId,
    decode: Arc<Decoder>,
    handler: Arc<Handler>,
}

/// One full-duplex typed channel over a connected `TcpStream`. Registration of methods
/// is local to each channel — two channels to the same peer don't share a registry.
pub struct RpcChannel {
    writer: Mutex<TcpStream>,
    methods: RwLock<HashMap<String, MethodEntry>>,
    peer_addr: SocketAddr,
    /// Fired once, with no arguments, when the receive loop exits for any reason.
    on_close: Mutex<Vec<Box<dyn Fn(&Arc<RpcChannel>) + Send + Sync>>>,
}

impl RpcChannel {
    pub fn new(stream: TcpStream) -> std::io::Result<Arc<Self>> {
        let peer_addr = stream.peer_addr()?;
        Ok(Arc::new(Self {
            writer: Mutex::new(stream),
            methods: RwLock::new(HashMap::new()),
            peer_addr,
            on_close: Mutex::new(Vec::new()),
        }))
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Associates `method` with payload type `T` and `handler`, invoked as
    /// `handler(channel, decoded_payload)` on the receive thread.
    pub fn register<T, F>(&self, method: impl Into<String>, handler: F)
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(&Arc<RpcChannel>, T) + Send + Sync + 'static,
    {
        let decode: Arc<Decoder> = Arc::new(|value: Value| {
            let decoded: T = serde_json::from_value(value)?;
            Ok(Box::new(decoded) as Box<dyn Any + Send>)
        });
        let handler: Arc<Handler> = Arc::new(move |channel, boxed| {
            let value = *boxed
                .downcast::<T>()
                .expect("decode() always produces the registered type");
            handler(channel, value);
        });
        self.methods.write().insert(
            method.into(),
            MethodEntry { payload_type: TypeId::of::<T>(), decode, handler },
        );
    }

    /// Registers a callback fired once when the receive loop exits (EOF, framer
    /// failure, or I/O error on read).
    pub fn on_close<F>(&self, callback: F)
    where
        F: Fn(&Arc<RpcChannel>) + Send + Sync + 'static,
    {
        self.on_close.lock().push(Box::new(callback));
    }

    /// Serialises and transmits `payload` under `method`. Fails with `UnknownMethod` if
    /// nothing was registered under that name on this channel, or `WrongType` if `T`
    /// doesn't match the type given to `register` for that method — in either case
    /// nothing is written to the socket.
    pub fn send<T>(&self, method: &str, payload: &T) -> Result<(), Error>
    where
        T: Serialize + 'static,
    {
        {
            let methods = self.methods.read();
            let entry = methods
                .get(method)
                .ok_or_else(|| Error::UnknownMethod(method.to_string()))?;
            if entry.payload_type != TypeId::of::<T>() {
                return Err(Error::WrongType);
            }
        }

        let value = serde_json::to_value(payload)?;
        let msg = WireMessage { method: method.to_string(), payload: value };
        let mut raw = serde_json::to_vec(&msg)?;
        raw.push(b'\n');

        self.writer.lock().write_all(&raw)?;
        Ok(())
    }

    /// Shuts the underlying socket down in both directions. The receive thread then
    /// observes EOF (or an I/O error) on its next read and runs the `on_close`
    /// callbacks exactly as it would on a peer-initiated disconnect.
    pub fn close(&self) {
        if let Err(e) = self.writer.lock().shutdown(Shutdown::Both) {
            log::debug!("shutdown of channel to {} failed (already closed?): {e}", self.peer_addr);
        }
    }

    /// Spawns the receive thread: reads framed records, decodes, and dispatches to the
    /// registered handler. A malformed record or unknown method is logged and does not
    /// stop the loop; the loop itself only ends on EOF or a framer/I/O failure.
    pub fn run_server(self: &Arc<Self>) {
        let channel = Arc::clone(self);
        let reader = channel.writer.lock().try_clone().expect("clone TCP stream for reads");
        thread::spawn(move || {
            let mut frames = FrameReader::new(reader);
            loop {
                match frames.next_record() {
                    Ok(Some(record)) => channel.dispatch(&record),
                    Ok(None) => break,
                    Err(e) => {
                        log::warn!("rpc channel {} terminating: {e}", channel.peer_addr);
                        break;
                    },
                }
            }
            for callback in channel.on_close.lock().iter() {
                callback(&channel);
            }
        });
    }

    fn dispatch(self: &Arc<Self>, record: &[u8]) {
        let msg: WireMessage = match serde_json::from_slice(record) {
            Ok(msg) => msg,
            Err(e) => {
                log::warn!("malformed RPC record from {}: {e}", self.peer_addr);
                return;
            },
        };

        let (decode, handler) = {
            let methods = self.methods.read();
            match methods.get(&msg.method) {
                Some(entry) => (Arc::clone(&entry.decode), Arc::clone(&entry.handler)),
                None => {
                    log::warn!("unknown RPC method '{}' from {}", msg.method, self.peer_addr);
                    return;
                },
            }
        };

        let decoded = match decode(msg.payload) {
            Ok(decoded) => decoded,
            Err(e) => {
                log::warn!("bad payload for method '{}' from {}: {e}", msg.method, self.peer_addr);
                return;
            },
        };

        let channel = Arc::clone(self);
        let result = catch_unwind(AssertUnwindSafe(|| handler(&channel, decoded)));
        if result.is_err() {
            log::warn!("handler for method '{}' panicked", msg.method);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    #[derive(Serialize, serde::Deserialize, Debug, PartialEq, Clone)]
    struct Ping {
        n: u32,
    }

    fn connected_pair() -> (Arc<RpcChannel>, Arc<RpcChannel>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        (RpcChannel::new(server).unwrap(), RpcChannel::new(client).unwrap())
    }

    #[test]
    fn round_trip_delivers_decoded_payload() {
        let (server, client) = connected_pair();
        let received = Arc::new(Mutex::new(None));
        let received_clone = Arc::clone(&received);

        server.register::<Ping, _>("ping", move |_channel, ping| {
            *received_clone.lock() = Some(ping);
        });
        server.run_server();

        client.register::<Ping, _>("ping", |_, _| {});
        client.send("ping", &Ping { n: 42 }).unwrap();

        for _ in 0..100 {
            if received.lock().is_some() {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(*received.lock(), Some(Ping { n: 42 }));
    }

    #[test]
    fn send_with_wrong_type_fails_without_writing() {
        let (_server, client) = connected_pair();
        client.register::<Ping, _>("ping", |_, _| {});

        #[derive(Serialize)]
        struct NotAPing {
            x: String,
        }
        let result = client.send("ping", &NotAPing { x: "nope".to_string() });
        assert!(matches!(result, Err(Error::WrongType)));
    }

    #[test]
    fn send_to_unregistered_method_fails() {
        let (_server, client) = connected_pair();
        let result = client.send("ping", &Ping { n: 1 });
        assert!(matches!(result, Err(Error::UnknownMethod(_))));
    }

    #[test]
    fn close_runs_on_close_callbacks() {
        let (server, client) = connected_pair();
        let closed = Arc::new(AtomicU32::new(0));
        let closed_clone = Arc::clone(&closed);
        server.on_close(move |_| {
            closed_clone.fetch_add(1, Ordering::SeqCst);
        });
        server.run_server();

        client.close();

        for _ in 0..100 {
            if closed.load(Ordering::SeqCst) == 1 {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(closed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn malformed_record_does_not_stop_dispatch() {
        let (server, client) = connected_pair();
        let count = Arc::new(AtomicU32::new(0));
        let count_clone = Arc::clone(&count);

        server.register::<Ping, _>("ping", move |_, _| {
            count_clone.fetch_add(1, Ordering::SeqCst);
        });
        server.run_server();

        client.writer.lock().write_all(b"not json at all\n").unwrap();
        client.register::<Ping, _>("ping", |_, _| {});
        client.send("ping", &Ping { n: 7 }).unwrap();

        for _ in 0..100 {
            if count.load(Ordering::SeqCst) == 1 {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
