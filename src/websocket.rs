use std::net::TcpListener;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::{info, warn};
use serde::Serialize;
use tungstenite::{Message, accept};

use crate::store::ChannelStore;

/// Pushed to every live client once per interval.
#[derive(Debug, Clone, Serialize)]
pub struct StateMessage {
    #[serde(rename = "type")]
    pub msg_type: &'static str,
    pub timestamp: i64,
    pub speed: u16,
    pub target: Vec<u8>,
    pub current: Vec<u8>,
}

impl StateMessage {
    pub fn capture(store: &ChannelStore) -> Self {
        let snapshot = store.read_all();
        StateMessage {
            msg_type: "state",
            timestamp: chrono::Utc::now().timestamp_millis(),
            speed: store.fade_speed(),
            target: snapshot.target,
            current: snapshot.current,
        }
    }
}

pub fn websocket_thread(server: TcpListener, store: Arc<ChannelStore>, interval: Duration) {
    if let Ok(addr) = server.local_addr() {
        info!("[WS] state stream listening on {}", addr);
    }

    for stream in server.incoming() {
        let stream = match stream {
            Ok(s) => s,
            Err(e) => {
                warn!("[WS] connection error: {}", e);
                continue;
            }
        };

        let store = Arc::clone(&store);
        thread::spawn(move || {
            let mut websocket = match accept(stream) {
                Ok(ws) => ws,
                Err(e) => {
                    warn!("[WS] handshake error: {}", e);
                    return;
                }
            };

            info!("[WS] client connected");

            loop {
                match serde_json::to_string(&StateMessage::capture(&store)) {
                    Ok(json) => {
                        if websocket.send(Message::Text(json)).is_err() {
                            info!("[WS] client disconnected");
                            break;
                        }
                    }
                    Err(e) => warn!("[WS] JSON serialization error: {}", e),
                }

                thread::sleep(interval);
            }
        });
    }
}
