use bytes::{BufMut, BytesMut};
use uuid::Uuid;

use crate::buffers::buf_ext::{clamp_to_u8, BufExt, BufMutExt};
use crate::error::DecodeResult;
use crate::message_type::MessageTypeId;
use crate::messages::Message;
use crate::structured::{StructuredMessage, StructuredValue};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MapBlock {
    pub x: u16,
    pub y: u16,
    pub name: String,
    pub access: u8,
    pub region_flags: u32,
    pub water_height: u8,
    /// The number of agents in the region. The binary form saturates at 255, the structured
    ///  form carries the full count.
    pub agents: u32,
    pub map_image_id: Uuid,
}

/// Map tiles for a requested area. Large areas exceed the binary form's 255 block limit, so
///  the structured fallback channel is the preferred way to deliver big replies.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MapBlockReply {
    pub agent_id: Uuid,
    pub flags: u32,
    pub blocks: Vec<MapBlock>,
}

impl Message for MapBlockReply {
    const TYPE: MessageTypeId = MessageTypeId::low(409);
    const NAME: &'static str = "MapBlockReply";

    fn serialize(&self, buf: &mut BytesMut) {
        buf.put_uuid(&self.agent_id);
        buf.put_u32_le(self.flags);

        let count = buf.put_count8(self.blocks.len());
        for block in &self.blocks[..count] {
            buf.put_u16_le(block.x);
            buf.put_u16_le(block.y);
            buf.put_string_len8(&block.name);
            buf.put_u8(block.access);
            buf.put_u32_le(block.region_flags);
            buf.put_u8(block.water_height);
            buf.put_u8(clamp_to_u8(block.agents));
            buf.put_uuid(&block.map_image_id);
        }
    }

    fn decode(buf: &mut &[u8]) -> DecodeResult<Self> {
        let agent_id = buf.read_uuid()?;
        let flags = buf.read_u32_le()?;

        let count = buf.read_u8()? as usize;
        let mut blocks = Vec::with_capacity(count);
        for _ in 0..count {
            blocks.push(MapBlock {
                x: buf.read_u16_le()?,
                y: buf.read_u16_le()?,
                name: buf.read_string_len8()?,
                access: buf.read_u8()?,
                region_flags: buf.read_u32_le()?,
                water_height: buf.read_u8()?,
                agents: buf.read_u8()? as u32,
                map_image_id: buf.read_uuid()?,
            });
        }

        Ok(MapBlockReply {
            agent_id,
            flags,
            blocks,
        })
    }
}

impl StructuredMessage for MapBlockReply {
    fn event_name(&self) -> &'static str {
        Self::NAME
    }

    fn to_structured(&self) -> StructuredValue {
        let agent_data = StructuredValue::map()
            .with("AgentID", self.agent_id.into())
            .with("Flags", StructuredValue::from_u32(self.flags))
            .build();

        let data = self.blocks.iter()
            .map(|block| StructuredValue::map()
                .with("X", block.x.into())
                .with("Y", block.y.into())
                .with("Name", block.name.as_str().into())
                .with("Access", block.access.into())
                .with("RegionFlags", StructuredValue::from_u32(block.region_flags))
                .with("WaterHeight", block.water_height.into())
                .with("Agents", StructuredValue::Integer(i32::try_from(block.agents).unwrap_or(i32::MAX)))
                .with("MapImageID", block.map_image_id.into())
                .build())
            .collect();

        StructuredValue::map()
            .with("AgentData", StructuredValue::Array(vec![agent_data]))
            .with("Data", StructuredValue::Array(data))
            .build()
    }
}
