use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use crate::error::{Error, Result};

/// DHCP option tags this server reads or writes. Unknown tags still travel
/// through the [`Options`] map untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OptionTag {
    Pad = 0,
    SubnetMask = 1,
    TimeOffset = 2,
    Router = 3,
    DomainNameServer = 6,
    Hostname = 12,
    DomainName = 15,
    RequestedIpAddress = 50,
    IpLeaseTime = 51,
    MessageType = 53,
    ServerIdentifier = 54,
    ParameterRequestList = 55,
    ClientIdentifier = 61,
    End = 255,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Discover = 1,
    Offer = 2,
    Request = 3,
    Decline = 4,
    Ack = 5,
    Nak = 6,
    Release = 7,
}

impl TryFrom<u8> for MessageType {
    type Error = u8;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Discover),
            2 => Ok(Self::Offer),
            3 => Ok(Self::Request),
            4 => Ok(Self::Decline),
            5 => Ok(Self::Ack),
            6 => Ok(Self::Nak),
            7 => Ok(Self::Release),
            other => Err(other),
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Discover => write!(f, "DISCOVER"),
            Self::Offer => write!(f, "OFFER"),
            Self::Request => write!(f, "REQUEST"),
            Self::Decline => write!(f, "DECLINE"),
            Self::Ack => write!(f, "ACK"),
            Self::Nak => write!(f, "NAK"),
            Self::Release => write!(f, "RELEASE"),
        }
    }
}

/// The parsed options region: an ordered tag-to-bytes map. A tag appearing
/// twice on the wire keeps its last value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Options(BTreeMap<u8, Vec<u8>>);

impl Options {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// Parses a TLV options stream. Pad (0) skips a single byte, End (255)
    /// terminates the stream; every other tag carries a length byte,
    /// including SubnetMask and TimeOffset.
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut options = BTreeMap::new();
        let mut index = 0;

        while index < data.len() {
            let tag = data[index];

            if tag == OptionTag::Pad as u8 {
                index += 1;
                continue;
            }

            if tag == OptionTag::End as u8 {
                break;
            }

            if index + 1 >= data.len() {
                return Err(Error::PacketMalformed("option length missing".to_string()));
            }

            let length = data[index + 1] as usize;

            if index + 2 + length > data.len() {
                return Err(Error::PacketMalformed("option data truncated".to_string()));
            }

            options.insert(tag, data[index + 2..index + 2 + length].to_vec());
            index += 2 + length;
        }

        Ok(Self(options))
    }

    /// Serializes the map in ascending tag order, terminated by the End tag.
    pub fn encode(&self) -> Vec<u8> {
        let mut buffer = Vec::new();
        for (tag, value) in &self.0 {
            buffer.push(*tag);
            buffer.push(value.len() as u8);
            buffer.extend_from_slice(value);
        }
        buffer.push(OptionTag::End as u8);
        buffer
    }

    pub fn get(&self, tag: OptionTag) -> Option<&[u8]> {
        self.0.get(&(tag as u8)).map(Vec::as_slice)
    }

    pub fn contains(&self, tag: OptionTag) -> bool {
        self.0.contains_key(&(tag as u8))
    }

    pub fn insert(&mut self, tag: OptionTag, value: Vec<u8>) {
        self.0.insert(tag as u8, value);
    }

    pub fn insert_ip(&mut self, tag: OptionTag, addr: Ipv4Addr) {
        self.insert(tag, addr.octets().to_vec());
    }

    /// Concatenates addresses into a single 4-byte-per-entry value, the
    /// layout of the DomainNameServer and Router options.
    pub fn insert_ips(&mut self, tag: OptionTag, addrs: &[Ipv4Addr]) {
        let mut value = Vec::with_capacity(addrs.len() * 4);
        for addr in addrs {
            value.extend_from_slice(&addr.octets());
        }
        self.insert(tag, value);
    }

    pub fn insert_u32(&mut self, tag: OptionTag, value: u32) {
        self.insert(tag, value.to_be_bytes().to_vec());
    }

    pub fn insert_str(&mut self, tag: OptionTag, value: &str) {
        self.insert(tag, value.as_bytes().to_vec());
    }

    pub fn message_type(&self) -> Option<MessageType> {
        self.get(OptionTag::MessageType)
            .and_then(|value| value.first().copied())
            .and_then(|byte| MessageType::try_from(byte).ok())
    }

    pub fn requested_ip(&self) -> Option<Ipv4Addr> {
        self.ip_value(OptionTag::RequestedIpAddress)
    }

    pub fn server_identifier(&self) -> Option<Ipv4Addr> {
        self.ip_value(OptionTag::ServerIdentifier)
    }

    pub fn hostname(&self) -> Option<String> {
        self.get(OptionTag::Hostname)
            .map(|value| String::from_utf8_lossy(value).to_string())
    }

    fn ip_value(&self, tag: OptionTag) -> Option<Ipv4Addr> {
        self.get(tag).and_then(|value| {
            let octets: [u8; 4] = value.try_into().ok()?;
            Some(Ipv4Addr::from(octets))
        })
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_type_roundtrip() {
        for value in 1..=7u8 {
            let msg_type = MessageType::try_from(value).unwrap();
            assert_eq!(msg_type as u8, value);
        }
        assert!(MessageType::try_from(0).is_err());
        assert!(MessageType::try_from(8).is_err());
    }

    #[test]
    fn test_parse_collects_tags() {
        let data = [53, 1, 1, 50, 4, 10, 0, 0, 5, 255];
        let options = Options::parse(&data).unwrap();

        assert_eq!(options.message_type(), Some(MessageType::Discover));
        assert_eq!(options.requested_ip(), Some(Ipv4Addr::new(10, 0, 0, 5)));
    }

    #[test]
    fn test_parse_skips_pad_and_stops_at_end() {
        let data = [0, 0, 53, 1, 2, 255, 50, 4, 1, 2, 3, 4];
        let options = Options::parse(&data).unwrap();

        assert_eq!(options.message_type(), Some(MessageType::Offer));
        // Tag 50 sits after End and must be ignored.
        assert!(options.requested_ip().is_none());
    }

    #[test]
    fn test_parse_last_occurrence_wins() {
        let data = [50, 4, 10, 0, 0, 1, 50, 4, 10, 0, 0, 2, 255];
        let options = Options::parse(&data).unwrap();
        assert_eq!(options.requested_ip(), Some(Ipv4Addr::new(10, 0, 0, 2)));
    }

    #[test]
    fn test_parse_subnet_mask_uniform_tlv() {
        let data = [1, 4, 255, 255, 255, 0, 255];
        let options = Options::parse(&data).unwrap();
        assert_eq!(
            options.get(OptionTag::SubnetMask),
            Some(&[255, 255, 255, 0][..])
        );
    }

    #[test]
    fn test_parse_truncated_option() {
        assert!(Options::parse(&[53]).is_err());
        assert!(Options::parse(&[53, 4, 1]).is_err());
    }

    #[test]
    fn test_encode_decode_identity() {
        let mut options = Options::new();
        options.insert(OptionTag::MessageType, vec![MessageType::Offer as u8]);
        options.insert_ip(OptionTag::ServerIdentifier, Ipv4Addr::new(10, 0, 0, 1));
        options.insert_u32(OptionTag::IpLeaseTime, 86400);
        options.insert_str(OptionTag::DomainName, "lan");
        options.insert_ips(
            OptionTag::DomainNameServer,
            &[Ipv4Addr::new(1, 1, 1, 1), Ipv4Addr::new(9, 9, 9, 9)],
        );

        let encoded = options.encode();
        assert_eq!(*encoded.last().unwrap(), 255);

        let decoded = Options::parse(&encoded).unwrap();
        assert_eq!(decoded, options);
    }

    #[test]
    fn test_empty_options_region() {
        let options = Options::parse(&[255]).unwrap();
        assert!(options.is_empty());

        let encoded = options.encode();
        assert_eq!(encoded, vec![255]);
    }

    #[test]
    fn test_name_server_concatenation() {
        let mut options = Options::new();
        options.insert_ips(
            OptionTag::DomainNameServer,
            &[Ipv4Addr::new(1, 1, 1, 1), Ipv4Addr::new(9, 9, 9, 9)],
        );
        assert_eq!(
            options.get(OptionTag::DomainNameServer),
            Some(&[1, 1, 1, 1, 9, 9, 9, 9][..])
        );
    }
}
