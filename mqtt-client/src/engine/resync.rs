use crate::error::Result;
use crate::transport::Transport;

use super::publish::{encode_pubrel, encode_publish};
use super::{Engine, SharedEngine};

impl<T: Transport + 'static> Engine<T> {
    /// §4.4.5: on a `cleanStart = false` CONNACK, resend every in-flight
    /// PUBREL then every in-flight PUBLISH, both with DUP set. Subscribe
    /// and unsubscribe tables are deliberately left alone — SUBSCRIBE state
    /// is not persistent across sessions.
    pub(super) async fn resync_session(&mut self, shared: &SharedEngine<T>) -> Result<()> {
        let release_ids: Vec<_> = self
            .session
            .lock()
            .unwrap()
            .window_pub_release
            .keys()
            .copied()
            .collect();

        for packet_id in release_ids {
            log::info!("resync: resending PUBREL {}", packet_id);
            let bytes = encode_pubrel(packet_id);
            self.write_packet(&bytes).await?;
            self.rearm_release_retry(shared, packet_id);
        }

        let publish_ids: Vec<_> = self
            .session
            .lock()
            .unwrap()
            .window_publish
            .keys()
            .copied()
            .collect();

        for packet_id in publish_ids {
            let bytes = {
                let mut session = self.session.lock().unwrap();
                match session.window_publish.get_mut(&packet_id) {
                    Some(request) => {
                        request.dup = true;
                        Some(encode_publish(request))
                    }
                    None => None,
                }
            };

            let bytes = match bytes {
                Some(bytes) => bytes,
                None => continue,
            };

            log::info!("resync: resending PUBLISH {}", packet_id);
            self.write_packet(&bytes).await?;
            self.rearm_publish_retry(shared, packet_id, bytes.len());
        }

        Ok(())
    }
}
