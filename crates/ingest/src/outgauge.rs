//! OutGauge wire decoder.
//!
//! BeamNG.drive emits fixed 96-byte OutGauge datagrams, little-endian
//! fields at fixed offsets. BeamNG can multiplex its MotionSim protocol
//! on the same port; those packets carry a "BNG1" header so receivers can
//! skip them. Anything that is not exactly one well-formed OutGauge
//! packet is rejected, never a panic.
//!
//! Raw SI units are preserved; display conversion is a presentation
//! concern.

use byteorder::{LittleEndian, ReadBytesExt};
use std::io::{self, Cursor, Seek, SeekFrom};

pub const OUTGAUGE_PACKET_LEN: usize = 96;

const MOTIONSIM_HEADER: &[u8] = b"BNG1";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("unexpected packet length {0} (OutGauge packets are {OUTGAUGE_PACKET_LEN} bytes)")]
    Length(usize),
    #[error("MotionSim packet (BNG1 header)")]
    MotionSim,
    #[error("unknown gear byte 0x{0:02x}")]
    Gear(u8),
}

/// Wire-level reading, before the listener stamps source and receipt time.
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    pub speed_mps: f32,
    pub rpm: f32,
    pub gear: i8,
    pub g_force_x: f32,
    pub g_force_y: f32,
    pub throttle: f32,
    pub brake: f32,
    pub fuel: f32,
}

/// Decodes one datagram. Pure and deterministic: same bytes, same reading.
pub fn decode(data: &[u8]) -> Result<Reading, DecodeError> {
    if data.starts_with(MOTIONSIM_HEADER) {
        return Err(DecodeError::MotionSim);
    }
    if data.len() != OUTGAUGE_PACKET_LEN {
        return Err(DecodeError::Length(data.len()));
    }
    let gear_byte = data[10];
    let gear = gear_from_byte(gear_byte).ok_or(DecodeError::Gear(gear_byte))?;
    // Length is already validated; a short read here cannot happen.
    read_fields(&mut Cursor::new(data), gear).map_err(|_| DecodeError::Length(data.len()))
}

fn read_fields(c: &mut Cursor<&[u8]>, gear: i8) -> io::Result<Reading> {
    // time(4) car(4) flags(2) gear(1) plid(1)
    c.seek(SeekFrom::Start(12))?;
    let speed_mps = c.read_f32::<LittleEndian>()?;
    let rpm = c.read_f32::<LittleEndian>()?;
    let _turbo = c.read_f32::<LittleEndian>()?;
    let _eng_temp = c.read_f32::<LittleEndian>()?;
    let fuel = c.read_f32::<LittleEndian>()?;
    let _oil_pressure = c.read_f32::<LittleEndian>()?;
    let _oil_temp = c.read_f32::<LittleEndian>()?;
    let g_force_x = c.read_f32::<LittleEndian>()?;
    let _dash_lights = c.read_u32::<LittleEndian>()?;
    let _show_lights = c.read_u32::<LittleEndian>()?;
    let throttle = c.read_f32::<LittleEndian>()?;
    let brake = c.read_f32::<LittleEndian>()?;
    let _clutch = c.read_f32::<LittleEndian>()?;
    let g_force_y = c.read_f32::<LittleEndian>()?;
    // display1(12) display2(12) id(4) ignored
    Ok(Reading {
        speed_mps,
        rpm,
        gear,
        g_force_x,
        g_force_y,
        throttle,
        brake,
        fuel,
    })
}

/// Gear encoding varies by emitter: LFS-style ASCII ('R', 'N', '0'-'9')
/// or BeamNG's 1-indexed numerics (1 = neutral, 2 = first gear, ...).
/// 0 and 0xFF both show up in the wild for reverse.
fn gear_from_byte(b: u8) -> Option<i8> {
    match b {
        b'R' | b'r' => Some(-1),
        b'N' | b'n' => Some(0),
        b'0'..=b'9' => Some((b - b'0') as i8),
        1..=10 => Some((b - 1) as i8),
        0 | 0xFF => Some(-1),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use byteorder::WriteBytesExt;

    struct PacketBuilder {
        gear: u8,
        speed: f32,
        rpm: f32,
        fuel: f32,
        g_force_x: f32,
        g_force_y: f32,
        throttle: f32,
        brake: f32,
    }

    impl Default for PacketBuilder {
        fn default() -> Self {
            Self {
                gear: b'3',
                speed: 25.5,
                rpm: 3500.0,
                fuel: 0.75,
                g_force_x: 0.0,
                g_force_y: 0.0,
                throttle: 0.8,
                brake: 0.0,
            }
        }
    }

    impl PacketBuilder {
        fn build(&self) -> Vec<u8> {
            let mut p = Vec::with_capacity(OUTGAUGE_PACKET_LEN);
            p.write_u32::<LittleEndian>(12345).unwrap(); // time
            p.extend_from_slice(b"beam"); // car
            p.write_u16::<LittleEndian>(0).unwrap(); // flags
            p.push(self.gear);
            p.push(0); // plid
            p.write_f32::<LittleEndian>(self.speed).unwrap();
            p.write_f32::<LittleEndian>(self.rpm).unwrap();
            p.write_f32::<LittleEndian>(0.0).unwrap(); // turbo
            p.write_f32::<LittleEndian>(90.0).unwrap(); // eng temp
            p.write_f32::<LittleEndian>(self.fuel).unwrap();
            p.write_f32::<LittleEndian>(50.0).unwrap(); // oil pressure
            p.write_f32::<LittleEndian>(85.0).unwrap(); // oil temp
            p.write_f32::<LittleEndian>(self.g_force_x).unwrap();
            p.write_u32::<LittleEndian>(0).unwrap(); // dash lights
            p.write_u32::<LittleEndian>(0).unwrap(); // show lights
            p.write_f32::<LittleEndian>(self.throttle).unwrap();
            p.write_f32::<LittleEndian>(self.brake).unwrap();
            p.write_f32::<LittleEndian>(0.0).unwrap(); // clutch
            p.write_f32::<LittleEndian>(self.g_force_y).unwrap();
            p.extend_from_slice(b"SPEED      \0"); // display1
            p.extend_from_slice(b"RPM        \0"); // display2
            p.write_i32::<LittleEndian>(1).unwrap(); // id
            assert_eq!(p.len(), OUTGAUGE_PACKET_LEN);
            p
        }
    }

    #[test]
    fn decodes_valid_packet() {
        let r = decode(&PacketBuilder::default().build()).unwrap();
        assert_eq!(r.speed_mps, 25.5);
        assert_eq!(r.rpm, 3500.0);
        assert_eq!(r.gear, 3);
        assert_eq!(r.fuel, 0.75);
        assert_eq!(r.throttle, 0.8);
        assert_eq!(r.brake, 0.0);
    }

    #[test]
    fn decode_is_deterministic() {
        let pkt = PacketBuilder::default().build();
        assert_eq!(decode(&pkt).unwrap(), decode(&pkt).unwrap());
    }

    #[test]
    fn decodes_g_force_fields() {
        let pkt = PacketBuilder {
            g_force_x: -1.25,
            g_force_y: 0.5,
            ..PacketBuilder::default()
        }
        .build();
        let r = decode(&pkt).unwrap();
        assert_eq!(r.g_force_x, -1.25);
        assert_eq!(r.g_force_y, 0.5);
    }

    #[test]
    fn reverse_gear_char() {
        let pkt = PacketBuilder { gear: b'R', ..PacketBuilder::default() }.build();
        assert_eq!(decode(&pkt).unwrap().gear, -1);
    }

    #[test]
    fn neutral_gear_char() {
        let pkt = PacketBuilder { gear: b'N', ..PacketBuilder::default() }.build();
        assert_eq!(decode(&pkt).unwrap().gear, 0);
    }

    #[test]
    fn beamng_one_indexed_gear() {
        // BeamNG sends 4 for third gear (1 = neutral)
        let pkt = PacketBuilder { gear: 4, ..PacketBuilder::default() }.build();
        assert_eq!(decode(&pkt).unwrap().gear, 3);
    }

    #[test]
    fn unknown_gear_byte_is_rejected() {
        let pkt = PacketBuilder { gear: 0x7B, ..PacketBuilder::default() }.build();
        assert_eq!(decode(&pkt), Err(DecodeError::Gear(0x7B)));
    }

    #[test]
    fn motionsim_packets_are_skipped() {
        let mut pkt = vec![0u8; OUTGAUGE_PACKET_LEN];
        pkt[..4].copy_from_slice(b"BNG1");
        assert_eq!(decode(&pkt), Err(DecodeError::MotionSim));
    }

    #[test]
    fn wrong_length_is_rejected() {
        assert_eq!(decode(&[0u8; 50]), Err(DecodeError::Length(50)));
        assert_eq!(decode(&[0u8; 120]), Err(DecodeError::Length(120)));
        assert_eq!(decode(&[]), Err(DecodeError::Length(0)));
    }
}
