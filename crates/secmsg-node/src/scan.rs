//! The inbox matcher: decide whether a stored envelope belongs to
//! this node and, if so, file it.

use secmsg_protocol::encrypt::decrypt;
use secmsg_protocol::MessageHeader;
use secmsg_store::records::{message_key, InboxRecord};
use secmsg_types::{unix_time, Result, SmsgError};

use crate::node::SecureMsgNode;
use crate::SmsgEvent;

/// Probes an envelope against every owned address; on the first MAC
/// match, persists the raw envelope to the inbox and signals the
/// observer. Returns whether the message was ours.
///
/// The probe is MAC-only (`test_only`), so this runs on every stored
/// envelope without paying for decryption, and works even while the
/// wallet plaintext is unavailable.
pub(crate) fn scan_message(
    node: &SecureMsgNode,
    header: &MessageHeader,
    payload: &[u8],
) -> Result<bool> {
    if payload.len() < 8 {
        return Ok(false);
    }

    let mut matched = None;
    for address in node.keystore.owned_addresses() {
        let Some(secret) = node.keystore.secret_key(address.key_id()) else {
            continue;
        };
        match decrypt(true, &secret, header, payload) {
            Ok(_) => {
                tracing::debug!(address = %address, "message decrypts with owned address");
                matched = Some(address);
                break;
            }
            // The expected outcome for every address but the right one.
            Err(SmsgError::MacMismatch) => continue,
            Err(e) => {
                tracing::debug!(address = %address, error = %e, "probe failed");
                continue;
            }
        }
    }

    let Some(address) = matched else {
        return Ok(false);
    };

    let mut sample = [0u8; 8];
    sample.copy_from_slice(&payload[..8]);
    let key = message_key(header.timestamp, &sample);
    let addr_to = address.to_string();

    {
        let inbox = node.lock_inbox();
        if inbox.contains(&key)? {
            tracing::debug!("message already exists in inbox");
            return Ok(true);
        }

        let mut raw = Vec::with_capacity(header.to_bytes().len() + payload.len());
        raw.extend_from_slice(&header.to_bytes());
        raw.extend_from_slice(payload);

        inbox.insert(
            &key,
            &InboxRecord {
                time_received: unix_time(),
                addr_to: addr_to.clone(),
                message: raw,
            },
        )?;
        inbox.push_unread(&key)?;
    }

    node.emit(SmsgEvent::InboxChanged {
        key,
        addr_to: addr_to.clone(),
    });
    tracing::info!(address = %addr_to, "message saved to inbox");
    Ok(true)
}
