//! BACnet/IP point source.

use async_trait::async_trait;
use tracing::{debug, info, warn};

use heitz_bacnet::{BacnetClient, BacnetClientConfig};
use heitz_core::{PointDescriptor, PointSample};

use crate::config::BacnetConfig;
use crate::error::{AgentResult, ReadError};
use crate::source::PointSource;

/// Reads points from the configured target device.
///
/// Commandable objects (outputs and values) also get their priority array;
/// failing to read it never fails the point.
#[derive(Debug)]
pub struct BacnetSource {
    client: BacnetClient,
}

impl BacnetSource {
    /// Binds the local socket described by `config`.
    pub async fn bind(config: &BacnetConfig) -> AgentResult<Self> {
        let client_config = BacnetClientConfig::new(
            config.local_socket_addr()?,
            config.target_socket_addr()?,
            config.target_device_id,
        )
        .request_timeout(config.read_timeout());

        let client = BacnetClient::bind(client_config).await?;
        Ok(Self::from_client(client))
    }

    /// Wraps an already-bound client.
    pub fn from_client(client: BacnetClient) -> Self {
        BacnetSource { client }
    }

    /// The underlying client, for commands beyond reading.
    pub fn client(&self) -> &BacnetClient {
        &self.client
    }
}

#[async_trait]
impl PointSource for BacnetSource {
    fn name(&self) -> &'static str {
        "bacnet"
    }

    /// Probes the Device object. A silent device is not fatal: direct
    /// point reads are still attempted every tick.
    async fn connect(&self) -> AgentResult<()> {
        match self.client.probe_device().await {
            Ok(name) => info!(
                device = self.client.device_instance(),
                target = %self.client.target_addr(),
                name = %name,
                "Connected to BACnet device"
            ),
            Err(e) => warn!(
                device = self.client.device_instance(),
                target = %self.client.target_addr(),
                error = %e,
                "Device probe failed, will attempt direct reads"
            ),
        }
        Ok(())
    }

    async fn read_point(&self, point: &PointDescriptor) -> Result<PointSample, ReadError> {
        let value = self.client.read_present_value(point.object).await?;
        let mut sample = PointSample::new(value);

        if point.object.object_type.is_commandable() {
            match self.client.read_priority_array(point.object).await {
                Ok(priority_array) => sample = sample.with_priority_array(priority_array),
                Err(e) => debug!(
                    point = %point.name,
                    error = %e,
                    "Could not read priority array"
                ),
            }
        }

        Ok(sample)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use heitz_core::{ObjectReference, ObjectType};
    use std::net::SocketAddr;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::net::UdpSocket;

    const PRESENT_VALUE: u8 = 85;
    const PRIORITY_ARRAY: u8 = 87;

    /// Behaviour of the fake device per property.
    #[derive(Clone, Copy)]
    enum Reply {
        Real(f32),
        /// 16 slots, only the given 1-based priority holds a value.
        Priorities(usize, f32),
        /// Error PDU: unknown property.
        Error,
    }

    /// Builds a Complex-ACK echoing the request's object identifier.
    fn complex_ack(request: &[u8], reply: Reply) -> Vec<u8> {
        let invoke_id = request[8];
        let property = request[16];

        let mut apdu = vec![0x30, invoke_id, 0x0C, 0x0C];
        apdu.extend_from_slice(&request[11..15]);
        apdu.extend_from_slice(&[0x19, property, 0x3E]);
        match reply {
            Reply::Real(value) => {
                apdu.push(0x44);
                apdu.extend_from_slice(&value.to_be_bytes());
            }
            Reply::Priorities(active, value) => {
                for slot in 1..=16 {
                    if slot == active {
                        apdu.push(0x44);
                        apdu.extend_from_slice(&value.to_be_bytes());
                    } else {
                        apdu.push(0x00);
                    }
                }
            }
            Reply::Error => unreachable!(),
        }
        apdu.push(0x3F);
        frame(&apdu)
    }

    fn error_pdu(request: &[u8]) -> Vec<u8> {
        // Error PDU: class property (2), code unknown-property (32).
        frame(&[0x50, request[8], 0x0C, 0x91, 0x02, 0x91, 0x20])
    }

    fn frame(apdu: &[u8]) -> Vec<u8> {
        let total = (4 + 2 + apdu.len()) as u16;
        let mut frame = vec![0x81, 0x0A];
        frame.extend_from_slice(&total.to_be_bytes());
        frame.extend_from_slice(&[0x01, 0x00]);
        frame.extend_from_slice(apdu);
        frame
    }

    /// Fake device answering present-value and priority-array requests.
    async fn fake_device(present: Reply, priorities: Reply) -> SocketAddr {
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let addr = socket.local_addr().unwrap();

        tokio::spawn(async move {
            let mut buf = [0u8; 1536];
            loop {
                let Ok((len, peer)) = socket.recv_from(&mut buf).await else {
                    return;
                };
                let request = &buf[..len];
                let reply = match request[16] {
                    PRESENT_VALUE => present,
                    PRIORITY_ARRAY => priorities,
                    _ => Reply::Error,
                };
                let datagram = match reply {
                    Reply::Error => error_pdu(request),
                    other => complex_ack(request, other),
                };
                let _ = socket.send_to(&datagram, peer).await;
            }
        });

        addr
    }

    async fn source_for(target: SocketAddr) -> BacnetSource {
        let config = BacnetClientConfig::new("127.0.0.1:0".parse().unwrap(), target, 100)
            .request_timeout(Duration::from_millis(500));
        BacnetSource::from_client(BacnetClient::bind(config).await.unwrap())
    }

    fn point(object_type: ObjectType, instance: u32) -> PointDescriptor {
        PointDescriptor::new(
            "zone_temp",
            ObjectReference::new(object_type, instance).unwrap(),
            "°C",
            "",
        )
    }

    #[tokio::test]
    async fn test_analog_input_has_no_priority_array() {
        let target = fake_device(Reply::Real(21.5), Reply::Priorities(8, 21.5)).await;
        let source = source_for(target).await;

        let sample = source
            .read_point(&point(ObjectType::AnalogInput, 1))
            .await
            .unwrap();
        assert_eq!(sample.value, 21.5);
        assert!(sample.priority_array.is_none());
    }

    #[tokio::test]
    async fn test_commandable_point_reads_priority_array() {
        let target = fake_device(Reply::Real(19.0), Reply::Priorities(10, 19.0)).await;
        let source = source_for(target).await;

        let sample = source
            .read_point(&point(ObjectType::AnalogValue, 3))
            .await
            .unwrap();
        assert_eq!(sample.value, 19.0);

        let priorities = sample.priority_array.unwrap();
        assert_eq!(priorities.len(), 16);
        assert_eq!(priorities[9], Some(19.0));
        assert_eq!(heitz_core::active_priority(&priorities), Some(10));
    }

    #[tokio::test]
    async fn test_priority_array_failure_keeps_value() {
        let target = fake_device(Reply::Real(1.0), Reply::Error).await;
        let source = source_for(target).await;

        let sample = source
            .read_point(&point(ObjectType::BinaryValue, 2))
            .await
            .unwrap();
        assert_eq!(sample.value, 1.0);
        assert!(sample.priority_array.is_none());
    }

    #[tokio::test]
    async fn test_device_error_is_read_error() {
        let target = fake_device(Reply::Error, Reply::Error).await;
        let source = source_for(target).await;

        let err = source
            .read_point(&point(ObjectType::AnalogInput, 9))
            .await
            .unwrap_err();
        assert!(matches!(err, ReadError::Device(_)));
    }

    #[tokio::test]
    async fn test_silent_device_times_out() {
        // Bound but never answers
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let source = source_for(silent.local_addr().unwrap()).await;

        let err = source
            .read_point(&point(ObjectType::AnalogInput, 1))
            .await
            .unwrap_err();
        assert!(matches!(err, ReadError::Timeout(_)));

        // The probe fails too, but connect still succeeds
        assert!(source.connect().await.is_ok());
    }
}
