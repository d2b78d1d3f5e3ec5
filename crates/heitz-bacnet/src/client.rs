//! # BACnet/IP Client
//!
//! A ReadProperty / WriteProperty client bound to one target device.
//!
//! ## Request Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  read_property / write_property                                         │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  lock socket ── one request in flight per client                       │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  invoke_id = next (wraps at 256)                                       │
//! │  send request ───────────────────────────────────► target device       │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  recv until deadline                                                   │
//! │   ├── other peer?            → ignore                                  │
//! │   ├── not a reply / bad id?  → ignore                                  │
//! │   ├── Complex-ACK (read)     → decode values                           │
//! │   ├── Simple-ACK (write)     → done                                    │
//! │   └── Error/Reject/Abort     → BacnetError                             │
//! │       │                                                                 │
//! │  deadline passed → Timeout                                             │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, trace};

use heitz_core::{ObjectReference, PRIORITY_LEVELS};

use crate::codec::{
    decode_read_property_ack, decode_response, encode_read_property, encode_write_property,
    BacnetValue, PropertyIdentifier, ReadPropertyRequest, ResponseBody, WritePropertyRequest,
    MAX_DATAGRAM_LEN, MAX_PRIORITY, MIN_PRIORITY, SERVICE_READ_PROPERTY,
    SERVICE_WRITE_PROPERTY,
};
use crate::error::{BacnetError, BacnetResult};

// =============================================================================
// Configuration
// =============================================================================

/// Client configuration.
#[derive(Debug, Clone)]
pub struct BacnetClientConfig {
    /// Local address to bind (BACnet/IP normally uses port 47808).
    pub local_addr: SocketAddr,

    /// Target device's BACnet/IP address.
    pub target_addr: SocketAddr,

    /// Target device instance number.
    pub device_instance: u32,

    /// How long to wait for a matching reply.
    pub request_timeout: Duration,
}

impl BacnetClientConfig {
    pub fn new(local_addr: SocketAddr, target_addr: SocketAddr, device_instance: u32) -> Self {
        BacnetClientConfig {
            local_addr,
            target_addr,
            device_instance,
            request_timeout: Duration::from_secs(3),
        }
    }

    /// Sets the per-request timeout.
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

// =============================================================================
// Client
// =============================================================================

/// BACnet/IP client for one target device.
#[derive(Debug)]
pub struct BacnetClient {
    socket: Mutex<UdpSocket>,
    local_addr: SocketAddr,
    target_addr: SocketAddr,
    device_instance: u32,
    request_timeout: Duration,
    next_invoke_id: AtomicU8,
}

impl BacnetClient {
    /// Binds the local UDP socket.
    ///
    /// ## Errors
    /// `BacnetError::Io` if the address is unavailable (another BACnet
    /// application already owns port 47808, or the IP is not local).
    pub async fn bind(config: BacnetClientConfig) -> BacnetResult<Self> {
        let socket = UdpSocket::bind(config.local_addr).await?;
        let local_addr = socket.local_addr()?;

        info!(
            local = %local_addr,
            target = %config.target_addr,
            device = config.device_instance,
            "BACnet client bound"
        );

        Ok(BacnetClient {
            socket: Mutex::new(socket),
            local_addr,
            target_addr: config.target_addr,
            device_instance: config.device_instance,
            request_timeout: config.request_timeout,
            next_invoke_id: AtomicU8::new(0),
        })
    }

    /// Address the socket is actually bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn target_addr(&self) -> SocketAddr {
        self.target_addr
    }

    pub fn device_instance(&self) -> u32 {
        self.device_instance
    }

    /// Reads one property and returns its application values.
    ///
    /// ## Arguments
    /// * `request` - Object, property and optional array index
    ///
    /// ## Returns
    /// The values between the ACK's opening and closing tags. A scalar
    /// property yields one value; an array yields one per element.
    pub async fn read_property(
        &self,
        request: &ReadPropertyRequest,
    ) -> BacnetResult<Vec<BacnetValue>> {
        trace!(
            object = %request.object,
            property = request.property.code(),
            "Sending ReadProperty"
        );

        match self
            .transact(|invoke_id| encode_read_property(invoke_id, request))
            .await?
        {
            ResponseBody::ComplexAck { service, payload } if service == SERVICE_READ_PROPERTY => {
                Ok(decode_read_property_ack(&payload)?.values)
            }
            other => Err(BacnetError::Malformed(format!(
                "unexpected reply to ReadProperty: {:?}",
                other
            ))),
        }
    }

    /// Writes one property.
    ///
    /// ## Errors
    /// - `UnexpectedValue` if the priority is outside 1..=16 (nothing is sent)
    /// - `Device` when the device refuses the write (write-access-denied,
    ///   value-out-of-range, ...)
    pub async fn write_property(&self, request: &WritePropertyRequest) -> BacnetResult<()> {
        if let Some(priority) = request.priority {
            check_priority(priority)?;
        }

        debug!(
            object = %request.object,
            property = request.property.code(),
            value = ?request.value,
            priority = ?request.priority,
            "Sending WriteProperty"
        );

        match self
            .transact(|invoke_id| encode_write_property(invoke_id, request))
            .await?
        {
            ResponseBody::SimpleAck { service } if service == SERVICE_WRITE_PROPERTY => Ok(()),
            other => Err(BacnetError::Malformed(format!(
                "unexpected reply to WriteProperty: {:?}",
                other
            ))),
        }
    }

    /// Commands `present-value` at `priority`, encoded for the object type.
    pub async fn write_present_value(
        &self,
        object: ObjectReference,
        value: f64,
        priority: u8,
    ) -> BacnetResult<()> {
        let value = BacnetValue::present_value_for(object.object_type, value)?;
        self.write_property(&WritePropertyRequest::present_value(object, value, priority))
            .await
    }

    /// Releases this reader's command at `priority` by writing Null.
    pub async fn relinquish(&self, object: ObjectReference, priority: u8) -> BacnetResult<()> {
        self.write_property(&WritePropertyRequest::relinquish(object, priority))
            .await
    }

    /// Sends one confirmed request and waits for the reply carrying its
    /// invoke id. Error, Reject and Abort replies come back as errors.
    async fn transact<F>(&self, encode: F) -> BacnetResult<ResponseBody>
    where
        F: FnOnce(u8) -> Vec<u8>,
    {
        let socket = self.socket.lock().await;

        // fetch_add wraps at 256.
        let invoke_id = self.next_invoke_id.fetch_add(1, Ordering::Relaxed);
        socket.send_to(&encode(invoke_id), self.target_addr).await?;

        let deadline = Instant::now() + self.request_timeout;
        let mut buf = [0u8; MAX_DATAGRAM_LEN];

        loop {
            let received = tokio::time::timeout_at(deadline, socket.recv_from(&mut buf)).await;
            let (len, peer) = match received {
                Ok(result) => result?,
                Err(_) => {
                    return Err(BacnetError::Timeout {
                        timeout: self.request_timeout,
                    })
                }
            };

            if peer != self.target_addr {
                trace!(peer = %peer, "Ignoring datagram from another peer");
                continue;
            }

            let frame = match decode_response(&buf[..len]) {
                Ok(Some(frame)) if frame.invoke_id == invoke_id => frame,
                Ok(Some(frame)) => {
                    debug!(
                        expected = invoke_id,
                        received = frame.invoke_id,
                        "Ignoring reply for another invoke id"
                    );
                    continue;
                }
                Ok(None) => continue,
                Err(e) => {
                    debug!(error = %e, "Ignoring undecodable datagram");
                    continue;
                }
            };

            return match frame.body {
                ResponseBody::Error { class, code, .. } => {
                    Err(BacnetError::Device { class, code })
                }
                ResponseBody::Reject { reason } => Err(BacnetError::Rejected { reason }),
                ResponseBody::Abort { reason, .. } => Err(BacnetError::Aborted { reason }),
                body => Ok(body),
            };
        }
    }

    /// Reads `present-value` as a number.
    pub async fn read_present_value(&self, object: ObjectReference) -> BacnetResult<f64> {
        let values = self
            .read_property(&ReadPropertyRequest::new(
                object,
                PropertyIdentifier::PresentValue,
            ))
            .await?;

        let value = values
            .first()
            .ok_or_else(|| BacnetError::UnexpectedValue("empty present-value".to_string()))?;

        value.as_f64().ok_or_else(|| {
            BacnetError::UnexpectedValue(format!("present-value is not numeric: {:?}", value))
        })
    }

    /// Reads the 16-slot `priority-array` of a commandable object.
    ///
    /// NULL slots and non-numeric entries map to `None`.
    pub async fn read_priority_array(
        &self,
        object: ObjectReference,
    ) -> BacnetResult<Vec<Option<f64>>> {
        let values = self
            .read_property(&ReadPropertyRequest::new(
                object,
                PropertyIdentifier::PriorityArray,
            ))
            .await?;

        if values.len() != PRIORITY_LEVELS {
            return Err(BacnetError::UnexpectedValue(format!(
                "priority-array has {} entries",
                values.len()
            )));
        }

        Ok(values.iter().map(BacnetValue::as_f64).collect())
    }

    /// Reads an object's `object-name`.
    pub async fn read_object_name(&self, object: ObjectReference) -> BacnetResult<String> {
        let values = self
            .read_property(&ReadPropertyRequest::new(
                object,
                PropertyIdentifier::ObjectName,
            ))
            .await?;

        values
            .first()
            .and_then(BacnetValue::as_str)
            .map(str::to_string)
            .ok_or_else(|| BacnetError::UnexpectedValue("object-name is not a string".to_string()))
    }

    /// Confirms the target device answers by reading its Device object name.
    pub async fn probe_device(&self) -> BacnetResult<String> {
        let device = ObjectReference::device(self.device_instance)
            .map_err(|e| BacnetError::InvalidAddress(e.to_string()))?;
        self.read_object_name(device).await
    }
}

fn check_priority(priority: u8) -> BacnetResult<()> {
    if (MIN_PRIORITY..=MAX_PRIORITY).contains(&priority) {
        Ok(())
    } else {
        Err(BacnetError::UnexpectedValue(format!(
            "priority must be between {} and {}, got {}",
            MIN_PRIORITY, MAX_PRIORITY, priority
        )))
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
