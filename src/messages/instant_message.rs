use bytes::{BufMut, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use uuid::Uuid;

use crate::buffers::buf_ext::{BufExt, BufMutExt};
use crate::error::{DecodeError, DecodeResult};
use crate::message_type::MessageTypeId;
use crate::messages::Message;
use crate::structured::{StructuredMessage, StructuredValue};

#[derive(Copy, Clone, Debug, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum InstantMessageDialog {
    MessageFromAgent = 0,
    MessageBox = 1,
    GroupInvitation = 3,
    InventoryOffered = 4,
    InventoryAccepted = 5,
    InventoryDeclined = 6,
    GroupVote = 7,
    TaskInventoryOffered = 9,
    TaskInventoryAccepted = 10,
    TaskInventoryDeclined = 11,
    NewUserDefault = 12,
    SessionAdd = 13,
    SessionOfflineAdd = 14,
    SessionGroupStart = 15,
    SessionCardlessStart = 16,
    SessionSend = 17,
    SessionDrop = 18,
    MessageFromObject = 19,
    BusyAutoResponse = 20,
    ConsoleAndChatHistory = 21,
    RequestTeleport = 22,
    AcceptTeleport = 23,
    DenyTeleport = 24,
    GodLikeRequestTeleport = 25,
    RequestLure = 26,
    GotoUrl = 28,
    Session911Start = 29,
    Lure911 = 30,
    FromTaskAsAlert = 31,
    GroupNotice = 32,
    GroupNoticeInventoryAccepted = 33,
    GroupNoticeInventoryDeclined = 34,
    GroupInvitationAccept = 35,
    GroupInvitationDecline = 36,
    GroupNoticeRequested = 37,
    FriendshipOffered = 38,
    FriendshipAccepted = 39,
    FriendshipDeclined = 40,
    StartTyping = 41,
    StopTyping = 42,
}

/// A chat or system message between agents, objects and groups. Besides the binary form it can
///  be delivered over the structured fallback channel.
#[derive(Clone, Debug, PartialEq)]
pub struct ImprovedInstantMessage {
    pub agent_id: Uuid,
    pub session_id: Uuid,
    pub from_group: bool,
    pub to_agent_id: Uuid,
    pub parent_estate_id: u32,
    pub region_id: Uuid,
    pub position: [f32; 3],
    pub offline: u8,
    pub dialog: InstantMessageDialog,
    pub id: Uuid,
    pub timestamp: u32,
    /// at most 254 bytes of UTF-8 on the wire
    pub from_agent_name: String,
    pub message: String,
    pub binary_bucket: Vec<u8>,
}

impl Message for ImprovedInstantMessage {
    const TYPE: MessageTypeId = MessageTypeId::low(254);
    const NAME: &'static str = "ImprovedInstantMessage";
    const ZERO_CODED: bool = true;

    fn serialize(&self, buf: &mut BytesMut) {
        buf.put_uuid(&self.agent_id);
        buf.put_uuid(&self.session_id);

        buf.put_bool(self.from_group);
        buf.put_uuid(&self.to_agent_id);
        buf.put_u32_le(self.parent_estate_id);
        buf.put_uuid(&self.region_id);
        buf.put_vector3(&self.position);
        buf.put_u8(self.offline);
        buf.put_u8(self.dialog.into());
        buf.put_uuid(&self.id);
        buf.put_u32_le(self.timestamp);
        buf.put_string_len8(&self.from_agent_name);
        buf.put_string_len16(&self.message);
        buf.put_bytes_len16(&self.binary_bucket);
    }

    fn decode(buf: &mut &[u8]) -> DecodeResult<Self> {
        Ok(ImprovedInstantMessage {
            agent_id: buf.read_uuid()?,
            session_id: buf.read_uuid()?,
            from_group: buf.read_bool()?,
            to_agent_id: buf.read_uuid()?,
            parent_estate_id: buf.read_u32_le()?,
            region_id: buf.read_uuid()?,
            position: buf.read_vector3()?,
            offline: buf.read_u8()?,
            dialog: read_dialog(buf)?,
            id: buf.read_uuid()?,
            timestamp: buf.read_u32_le()?,
            from_agent_name: buf.read_string_len8()?,
            message: buf.read_string_len16()?,
            binary_bucket: buf.read_bytes_len16()?,
        })
    }
}

fn read_dialog(buf: &mut &[u8]) -> DecodeResult<InstantMessageDialog> {
    let raw = buf.read_u8()?;
    InstantMessageDialog::try_from(raw)
        .map_err(|_| DecodeError::InvalidEnumValue { field: "Dialog", value: raw as u64 })
}

impl StructuredMessage for ImprovedInstantMessage {
    fn event_name(&self) -> &'static str {
        Self::NAME
    }

    fn to_structured(&self) -> StructuredValue {
        let agent_data = StructuredValue::map()
            .with("AgentID", self.agent_id.into())
            .with("SessionID", self.session_id.into())
            .build();

        let message_block = StructuredValue::map()
            .with("FromGroup", self.from_group.into())
            .with("ToAgentID", self.to_agent_id.into())
            .with("ParentEstateID", StructuredValue::from_u32(self.parent_estate_id))
            .with("RegionID", self.region_id.into())
            .with("Position", self.position.into())
            .with("Offline", self.offline.into())
            .with("Dialog", u8::from(self.dialog).into())
            .with("ID", self.id.into())
            .with("Timestamp", StructuredValue::from_u32(self.timestamp))
            .with("FromAgentName", self.from_agent_name.as_str().into())
            .with("Message", self.message.as_str().into())
            .with("BinaryBucket", StructuredValue::Binary(self.binary_bucket.clone()))
            .build();

        StructuredValue::map()
            .with("AgentData", StructuredValue::Array(vec![agent_data]))
            .with("MessageBlock", StructuredValue::Array(vec![message_block]))
            .build()
    }
}
