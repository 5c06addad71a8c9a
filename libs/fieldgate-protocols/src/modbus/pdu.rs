//! Modbus PDU: function code plus data, no addressing or checksum
//!
//! Requests are assembled in a fixed stack buffer sized to the largest PDU an
//! RS485 ADU can carry, so every request built here also fits RTU framing.

use fieldgate_link::bytes::pack_bits;
use fieldgate_link::{LinkError, Result};
use tracing::trace;

use super::constants::{
    exception_description, function_name, FC_WRITE_MULTIPLE_COILS, FC_WRITE_MULTIPLE_REGISTERS,
    FC_WRITE_SINGLE_COIL, FC_WRITE_SINGLE_REGISTER, MAX_PDU_SIZE, MAX_WRITE_COILS,
    MAX_WRITE_REGISTERS,
};

#[derive(Debug, Clone)]
pub struct ModbusPdu {
    data: [u8; MAX_PDU_SIZE],
    len: usize,
}

impl ModbusPdu {
    pub fn new() -> Self {
        Self {
            data: [0; MAX_PDU_SIZE],
            len: 0,
        }
    }

    pub fn push(&mut self, byte: u8) -> Result<()> {
        if self.len >= MAX_PDU_SIZE {
            return Err(LinkError::argument("PDU buffer full"));
        }
        self.data[self.len] = byte;
        self.len += 1;
        Ok(())
    }

    /// Big-endian
    pub fn push_u16(&mut self, value: u16) -> Result<()> {
        for b in value.to_be_bytes() {
            self.push(b)?;
        }
        Ok(())
    }

    pub fn extend(&mut self, data: &[u8]) -> Result<()> {
        if self.len + data.len() > MAX_PDU_SIZE {
            return Err(LinkError::argument(format!(
                "PDU would exceed max size: {} + {} > {}",
                self.len,
                data.len(),
                MAX_PDU_SIZE
            )));
        }
        self.data[self.len..self.len + data.len()].copy_from_slice(data);
        self.len += data.len();
        Ok(())
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn function_code(&self) -> Option<u8> {
        self.as_slice().first().copied()
    }
}

impl Default for ModbusPdu {
    fn default() -> Self {
        Self::new()
    }
}

/// Fluent request assembly
#[derive(Default)]
pub struct PduBuilder {
    pdu: ModbusPdu,
}

impl PduBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn function_code(mut self, fc: u8) -> Result<Self> {
        self.pdu.push(fc)?;
        Ok(self)
    }

    pub fn address(mut self, addr: u16) -> Result<Self> {
        self.pdu.push_u16(addr)?;
        Ok(self)
    }

    pub fn quantity(mut self, qty: u16) -> Result<Self> {
        self.pdu.push_u16(qty)?;
        Ok(self)
    }

    pub fn byte(mut self, b: u8) -> Result<Self> {
        self.pdu.push(b)?;
        Ok(self)
    }

    pub fn data(mut self, data: &[u8]) -> Result<Self> {
        self.pdu.extend(data)?;
        Ok(self)
    }

    pub fn build(self) -> ModbusPdu {
        if let Some(fc) = self.pdu.function_code() {
            trace!(
                "PDU built: FC={:02X} ({}), len={}",
                fc,
                function_name(fc),
                self.pdu.len()
            );
        }
        self.pdu
    }
}

/// FC01-04
pub fn read_request(fc: u8, start: u16, quantity: u16) -> Result<ModbusPdu> {
    if !matches!(fc, 0x01..=0x04) {
        return Err(LinkError::argument(format!(
            "FC{:02X} is not a read function",
            fc
        )));
    }
    Ok(PduBuilder::new()
        .function_code(fc)?
        .address(start)?
        .quantity(quantity)?
        .build())
}

/// FC05: 0xFF00 switches the coil on, 0x0000 off
pub fn write_single_coil(address: u16, value: bool) -> Result<ModbusPdu> {
    Ok(PduBuilder::new()
        .function_code(FC_WRITE_SINGLE_COIL)?
        .address(address)?
        .byte(if value { 0xFF } else { 0x00 })?
        .byte(0x00)?
        .build())
}

/// FC06
pub fn write_single_register(address: u16, value: [u8; 2]) -> Result<ModbusPdu> {
    Ok(PduBuilder::new()
        .function_code(FC_WRITE_SINGLE_REGISTER)?
        .address(address)?
        .data(&value)?
        .build())
}

/// FC15, coil values packed LSB first
pub fn write_multiple_coils(start: u16, values: &[bool]) -> Result<ModbusPdu> {
    if values.is_empty() || values.len() > usize::from(MAX_WRITE_COILS) {
        return Err(LinkError::argument(format!(
            "Invalid coil count for FC15: {}",
            values.len()
        )));
    }

    let packed = pack_bits(values);
    Ok(PduBuilder::new()
        .function_code(FC_WRITE_MULTIPLE_COILS)?
        .address(start)?
        .quantity(values.len() as u16)?
        .byte(packed.len() as u8)?
        .data(&packed)?
        .build())
}

/// FC16, `data` holds whole big-endian registers
pub fn write_multiple_registers(start: u16, data: &[u8]) -> Result<ModbusPdu> {
    let count = data.len() / 2;
    if data.is_empty() || data.len() % 2 != 0 || count > usize::from(MAX_WRITE_REGISTERS) {
        return Err(LinkError::argument(format!(
            "Invalid register payload for FC16: {} bytes",
            data.len()
        )));
    }

    Ok(PduBuilder::new()
        .function_code(FC_WRITE_MULTIPLE_REGISTERS)?
        .address(start)?
        .quantity(count as u16)?
        .byte(data.len() as u8)?
        .data(data)?
        .build())
}

/// Check a response PDU's function code, surfacing exceptions
///
/// Returns the data after the function code.
pub fn check_response(pdu: &[u8], expected_fc: u8) -> Result<&[u8]> {
    let (&fc, data) = pdu
        .split_first()
        .ok_or_else(|| LinkError::protocol("Empty response PDU"))?;

    if fc & 0x80 != 0 {
        let code = data.first().copied().unwrap_or(0);
        return Err(LinkError::protocol(format!(
            "Modbus exception on {}: {} (0x{:02X})",
            function_name(fc),
            exception_description(code),
            code
        )));
    }

    if fc != expected_fc {
        return Err(LinkError::protocol(format!(
            "Function code mismatch: expected {:02X}, got {:02X}",
            expected_fc, fc
        )));
    }

    Ok(data)
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_pdu_builder() {
        let pdu = PduBuilder::new()
            .function_code(0x03)
            .unwrap()
            .address(0x0100)
            .unwrap()
            .quantity(0x000A)
            .unwrap()
            .build();
        assert_eq!(pdu.as_slice(), &[0x03, 0x01, 0x00, 0x00, 0x0A]);
    }

    #[test]
    fn test_pdu_overflow() {
        let mut pdu = ModbusPdu::new();
        assert!(pdu.extend(&[0xFF; MAX_PDU_SIZE + 1]).is_err());
        pdu.extend(&[0; MAX_PDU_SIZE - 1]).unwrap();
        assert!(pdu.push_u16(0x1234).is_err());
    }

    #[test]
    fn test_read_request_rejects_write_fc() {
        assert!(read_request(0x06, 0, 1).is_err());
        assert_eq!(
            read_request(0x04, 0x002C, 2).unwrap().as_slice(),
            &[0x04, 0x00, 0x2C, 0x00, 0x02]
        );
    }

    #[test]
    fn test_write_single_coil() {
        assert_eq!(
            write_single_coil(0x0100, true).unwrap().as_slice(),
            &[0x05, 0x01, 0x00, 0xFF, 0x00]
        );
        assert_eq!(
            write_single_coil(0x0200, false).unwrap().as_slice(),
            &[0x05, 0x02, 0x00, 0x00, 0x00]
        );
    }

    #[test]
    fn test_write_multiple_coils_packing() {
        let values = [true, false, true, true, false, false, false, false, true];
        let pdu = write_multiple_coils(0x0013, &values).unwrap();
        assert_eq!(
            pdu.as_slice(),
            &[0x0F, 0x00, 0x13, 0x00, 0x09, 0x02, 0b0000_1101, 0x01]
        );
        assert!(write_multiple_coils(0, &[]).is_err());
    }

    #[test]
    fn test_write_multiple_registers() {
        let pdu = write_multiple_registers(1, &[0x00, 0x0A, 0x01, 0x02]).unwrap();
        assert_eq!(
            pdu.as_slice(),
            &[0x10, 0x00, 0x01, 0x00, 0x02, 0x04, 0x00, 0x0A, 0x01, 0x02]
        );
        assert!(write_multiple_registers(1, &[0x00]).is_err());
        assert!(write_multiple_registers(1, &[0; 248]).is_err());
    }

    #[test]
    fn test_check_response() {
        assert_eq!(check_response(&[0x03, 0x02, 0x00, 0x01], 0x03).unwrap(), &[0x02, 0x00, 0x01]);

        let err = check_response(&[0x83, 0x02], 0x03).unwrap_err();
        assert!(err.to_string().contains("Illegal Data Address"));

        let err = check_response(&[0x04, 0x00], 0x03).unwrap_err();
        assert!(err.to_string().contains("mismatch"));

        assert!(check_response(&[], 0x03).is_err());
    }
}
