use crate::attributes::*;
use crate::checks::*;
use crate::message::*;
use shared::error::*;

pub const CHANGE_IP: u32 = 0x04;
pub const CHANGE_PORT: u32 = 0x02;

const CHANGE_REQUEST_SIZE: usize = 4;

/// ChangeRequest represents the CHANGE-REQUEST attribute, asking the server to answer
/// from its alternate address and/or port.
///
/// RFC 5780 Section 7.2
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq)]
pub struct ChangeRequest {
    pub change_ip: bool,
    pub change_port: bool,
}

impl ChangeRequest {
    pub fn new(change_ip: bool, change_port: bool) -> Self {
        ChangeRequest {
            change_ip,
            change_port,
        }
    }

    fn flags(&self) -> u32 {
        let mut flags = 0;
        if self.change_ip {
            flags |= CHANGE_IP;
        }
        if self.change_port {
            flags |= CHANGE_PORT;
        }
        flags
    }
}

impl Setter for ChangeRequest {
    fn add_to(&self, m: &mut Message) -> Result<()> {
        m.add(ATTR_CHANGE_REQUEST, &self.flags().to_be_bytes());
        Ok(())
    }
}

impl Getter for ChangeRequest {
    fn get_from(&mut self, m: &Message) -> Result<()> {
        let v = m.get(ATTR_CHANGE_REQUEST)?;
        check_size(ATTR_CHANGE_REQUEST, v.len(), CHANGE_REQUEST_SIZE)?;
        let flags = u32::from_be_bytes([v[0], v[1], v[2], v[3]]);
        self.change_ip = flags & CHANGE_IP != 0;
        self.change_port = flags & CHANGE_PORT != 0;
        Ok(())
    }
}
