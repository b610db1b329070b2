use anyhow::anyhow;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use tracing::debug;
use uuid::Uuid;

use crate::util::buf::{put_bytes, put_opt_string, put_string, put_uuid, try_get_bytes, try_get_opt_string, try_get_string, try_get_uuid};


const ID_DATA: u8 = 1;
const ID_DATAGRAM: u8 = 2;
const ID_ACK: u8 = 3;
const ID_ADMIN: u8 = 4;
const ID_HEARTBEAT: u8 = 5;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum MessageKind {
    Data,
    Datagram,
    Ack,
    Admin,
    Heartbeat,
}

/// A peer's verdict on a data message it received
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum AckOutcome {
    Success = 0,
    Queued = 1,
    Rejected = 2,
    /// the receiver could not take the message right now, it should be retried later
    FailedTemporarily = 3,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum AdminCommand {
    Shutdown = 0,
    Restart = 1,
    Suspend = 2,
    Resume = 3,
    /// sent by a peer to announce its sticky name
    Identify = 4,
}

/// Short message traffic between carriers and peers, the only kind of message that is tracked
///  until acknowledged.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DataMessage {
    pub id: Uuid,
    pub sender: String,
    /// the destination number, which doubles as the 'shortcode' for routing
    pub receiver: String,
    /// the carrier connection the message entered through
    pub carrier_id: Option<String>,
    /// the name of the peer this message must go to, set by the carrier layer
    pub sticky_name: Option<String>,
    pub body: Bytes,
}
impl DataMessage {
    pub fn new(sender: impl Into<String>, receiver: impl Into<String>, body: impl Into<Bytes>) -> DataMessage {
        DataMessage {
            id: Uuid::new_v4(),
            sender: sender.into(),
            receiver: receiver.into(),
            carrier_id: None,
            sticky_name: None,
            body: body.into(),
        }
    }

    pub fn with_carrier_id(mut self, carrier_id: impl Into<String>) -> DataMessage {
        self.carrier_id = Some(carrier_id.into());
        self
    }

    pub fn with_sticky_name(mut self, sticky_name: impl Into<String>) -> DataMessage {
        self.sticky_name = Some(sticky_name.into());
        self
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DatagramMessage {
    pub id: Uuid,
    pub source_address: String,
    pub source_port: u16,
    pub destination_address: String,
    pub destination_port: u16,
    pub body: Bytes,
}
impl DatagramMessage {
    pub fn new(source_address: impl Into<String>, source_port: u16, destination_address: impl Into<String>, destination_port: u16, body: impl Into<Bytes>) -> DatagramMessage {
        DatagramMessage {
            id: Uuid::new_v4(),
            source_address: source_address.into(),
            source_port,
            destination_address: destination_address.into(),
            destination_port,
            body: body.into(),
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AckMessage {
    /// id of the data message this acknowledges
    pub id: Uuid,
    pub outcome: AckOutcome,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AdminMessage {
    pub command: AdminCommand,
    pub sticky_name: Option<String>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct HeartbeatMessage {
    pub load: i64,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Message {
    Data(DataMessage),
    Datagram(DatagramMessage),
    Ack(AckMessage),
    Admin(AdminMessage),
    Heartbeat(HeartbeatMessage),
}
impl Message {
    pub fn ack_for(msg: &DataMessage, outcome: AckOutcome) -> Message {
        Message::Ack(AckMessage {
            id: msg.id,
            outcome,
        })
    }

    pub fn admin(command: AdminCommand) -> Message {
        Message::Admin(AdminMessage {
            command,
            sticky_name: None,
        })
    }

    pub fn identify(sticky_name: impl Into<String>) -> Message {
        Message::Admin(AdminMessage {
            command: AdminCommand::Identify,
            sticky_name: Some(sticky_name.into()),
        })
    }

    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Data(_) => MessageKind::Data,
            Message::Datagram(_) => MessageKind::Datagram,
            Message::Ack(_) => MessageKind::Ack,
            Message::Admin(_) => MessageKind::Admin,
            Message::Heartbeat(_) => MessageKind::Heartbeat,
        }
    }

    /// The message's own id for data and datagrams, the acknowledged message's id for acks
    pub fn id(&self) -> Option<Uuid> {
        match self {
            Message::Data(data) => Some(data.id),
            Message::Datagram(data) => Some(data.id),
            Message::Ack(data) => Some(data.id),
            Message::Admin(_) | Message::Heartbeat(_) => None,
        }
    }

    fn discriminator(&self) -> u8 {
        match self {
            Message::Data(_) => ID_DATA,
            Message::Datagram(_) => ID_DATAGRAM,
            Message::Ack(_) => ID_ACK,
            Message::Admin(_) => ID_ADMIN,
            Message::Heartbeat(_) => ID_HEARTBEAT,
        }
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u8(self.discriminator());
        match self {
            Message::Data(data) => Self::ser_data(data, buf),
            Message::Datagram(data) => Self::ser_datagram(data, buf),
            Message::Ack(data) => Self::ser_ack(data, buf),
            Message::Admin(data) => Self::ser_admin(data, buf),
            Message::Heartbeat(data) => buf.put_i64(data.load),
        }
    }

    fn ser_data(data: &DataMessage, buf: &mut impl BufMut) {
        put_uuid(buf, &data.id);
        put_string(buf, &data.sender);
        put_string(buf, &data.receiver);
        put_opt_string(buf, data.carrier_id.as_deref());
        put_opt_string(buf, data.sticky_name.as_deref());
        put_bytes(buf, &data.body);
    }

    fn ser_datagram(data: &DatagramMessage, buf: &mut impl BufMut) {
        put_uuid(buf, &data.id);
        put_string(buf, &data.source_address);
        buf.put_u16(data.source_port);
        put_string(buf, &data.destination_address);
        buf.put_u16(data.destination_port);
        put_bytes(buf, &data.body);
    }

    fn ser_ack(data: &AckMessage, buf: &mut impl BufMut) {
        put_uuid(buf, &data.id);
        buf.put_u8(data.outcome.into());
    }

    fn ser_admin(data: &AdminMessage, buf: &mut impl BufMut) {
        buf.put_u8(data.command.into());
        put_opt_string(buf, data.sticky_name.as_deref());
    }

    pub fn deser(buf: &[u8]) -> anyhow::Result<Message> {
        let mut buf = buf;
        let msg = match buf.try_get_u8()? {
            ID_DATA => Self::deser_data(&mut buf)?,
            ID_DATAGRAM => Self::deser_datagram(&mut buf)?,
            ID_ACK => Self::deser_ack(&mut buf)?,
            ID_ADMIN => Self::deser_admin(&mut buf)?,
            ID_HEARTBEAT => Message::Heartbeat(HeartbeatMessage {
                load: buf.try_get_i64()?,
            }),
            id => return Err(anyhow!("invalid message discriminator {}", id)),
        };

        if buf.has_remaining() {
            debug!("ignoring {} trailing bytes after {:?} message", buf.remaining(), msg.kind());
        }
        Ok(msg)
    }

    fn deser_data(buf: &mut impl Buf) -> anyhow::Result<Message> {
        let id = try_get_uuid(buf)?;
        let sender = try_get_string(buf)?;
        let receiver = try_get_string(buf)?;
        let carrier_id = try_get_opt_string(buf)?;
        let sticky_name = try_get_opt_string(buf)?;
        let body = try_get_bytes(buf)?;

        Ok(Message::Data(DataMessage {
            id,
            sender,
            receiver,
            carrier_id,
            sticky_name,
            body,
        }))
    }

    fn deser_datagram(buf: &mut impl Buf) -> anyhow::Result<Message> {
        let id = try_get_uuid(buf)?;
        let source_address = try_get_string(buf)?;
        let source_port = buf.try_get_u16()?;
        let destination_address = try_get_string(buf)?;
        let destination_port = buf.try_get_u16()?;
        let body = try_get_bytes(buf)?;

        Ok(Message::Datagram(DatagramMessage {
            id,
            source_address,
            source_port,
            destination_address,
            destination_port,
            body,
        }))
    }

    fn deser_ack(buf: &mut impl Buf) -> anyhow::Result<Message> {
        let id = try_get_uuid(buf)?;
        let outcome = AckOutcome::try_from(buf.try_get_u8()?)?;
        Ok(Message::Ack(AckMessage { id, outcome }))
    }

    fn deser_admin(buf: &mut impl Buf) -> anyhow::Result<Message> {
        let command = AdminCommand::try_from(buf.try_get_u8()?)?;
        let sticky_name = try_get_opt_string(buf)?;
        Ok(Message::Admin(AdminMessage { command, sticky_name }))
    }
}

#[cfg(test)]
mod test {
    use rstest::*;

    use super::*;

    #[rstest]
    #[case::data(Message::Data(DataMessage::new("4917012345", "700", "hello")), ID_DATA)]
    #[case::data_routed(Message::Data(DataMessage::new("4917012345", "700", "").with_carrier_id("smsc-a").with_sticky_name("shopA")), ID_DATA)]
    #[case::datagram(Message::Datagram(DatagramMessage::new("10.0.0.1", 9200, "10.0.0.2", 9201, vec![0u8, 1, 2])), ID_DATAGRAM)]
    #[case::ack(Message::Ack(AckMessage { id: Uuid::new_v4(), outcome: AckOutcome::FailedTemporarily }), ID_ACK)]
    #[case::admin(Message::admin(AdminCommand::Restart), ID_ADMIN)]
    #[case::identify(Message::identify("shopA"), ID_ADMIN)]
    #[case::heartbeat(Message::Heartbeat(HeartbeatMessage { load: -3 }), ID_HEARTBEAT)]
    fn test_ser_message(#[case] msg: Message, #[case] msg_id: u8) {
        let mut buf = BytesMut::new();
        msg.ser(&mut buf);
        assert_eq!(buf[0], msg_id);

        let deser_msg = Message::deser(&buf).unwrap();
        assert_eq!(msg, deser_msg);
    }

    #[rstest]
    #[case::empty(vec![])]
    #[case::unknown_kind(vec![99])]
    #[case::truncated_heartbeat(vec![ID_HEARTBEAT, 0, 0, 0])]
    #[case::invalid_admin_command(vec![ID_ADMIN, 42, 0])]
    fn test_deser_invalid(#[case] raw: Vec<u8>) {
        assert!(Message::deser(&raw).is_err());
    }

    #[test]
    fn test_deser_invalid_ack_outcome() {
        let mut buf = BytesMut::new();
        Message::ack_for(&DataMessage::new("a", "b", ""), AckOutcome::Success).ser(&mut buf);
        let last = buf.len() - 1;
        buf[last] = 17;
        assert!(Message::deser(&buf).is_err());
    }

    #[test]
    fn test_deser_ignores_trailing_bytes() {
        let msg = Message::deser(&[ID_HEARTBEAT, 0, 0, 0, 0, 0, 0, 0, 1, 7]).unwrap();
        assert_eq!(msg, Message::Heartbeat(HeartbeatMessage { load: 1 }));
    }

    #[test]
    fn test_ack_for() {
        let data = DataMessage::new("a", "b", "c");
        match Message::ack_for(&data, AckOutcome::Queued) {
            Message::Ack(ack) => {
                assert_eq!(ack.id, data.id);
                assert_eq!(ack.outcome, AckOutcome::Queued);
            }
            other => panic!("expected an ack, was {:?}", other),
        }
        assert_eq!(Message::ack_for(&data, AckOutcome::Queued).id(), Some(data.id));
        assert_eq!(Message::admin(AdminCommand::Suspend).id(), None);
    }
}
