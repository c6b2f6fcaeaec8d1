//! Packed little-endian stub dump.
//!
//! Layout: magic `GPSD`, u32 version, u32 event count; per event u64 id,
//! u8 truth flag (followed by u16 pT class and i8 charge when set), u32 stub
//! count and 24 bytes per stub:
//!
//! | field | type |
//! |-------|------|
//! | layer | u8 |
//! | phi | i32 |
//! | flags | u8 (bit 0 phi-bend, bit 1 radius, bit 2 endcap) |
//! | phi_b | i32 |
//! | eta | i32 |
//! | r | i32 |
//! | quality | u8 |
//! | bx | i32 |
//! | cluster size | u8 |

use std::fs::File;
use std::io;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use gpcore::data::layers::Region;
use gpcore::data::stub::Stub;
use gpcore::pattern::stats::TruthMuon;

use crate::data::events::Event;
use crate::data::patterns::open_input;
use crate::error::Result;

pub const RAW_MAGIC: &[u8; 4] = b"GPSD";
pub const RAW_VERSION: u32 = 1;
pub const RAW_STUB_SIZE: usize = 24;

const FLAG_PHI_B: u8 = 1;
const FLAG_R: u8 = 1 << 1;
const FLAG_ENDCAP: u8 = 1 << 2;

pub fn write_raw<W: Write>(w: &mut W, events: &[Event]) -> Result<()> {
    w.write_all(RAW_MAGIC)?;
    w.write_u32::<LittleEndian>(RAW_VERSION)?;
    w.write_u32::<LittleEndian>(events.len() as u32)?;
    for ev in events {
        w.write_u64::<LittleEndian>(ev.id)?;
        match ev.truth {
            Some(t) => {
                w.write_u8(1)?;
                w.write_u16::<LittleEndian>(t.pt_class)?;
                w.write_i8(t.charge)?;
            }
            None => w.write_u8(0)?,
        }
        w.write_u32::<LittleEndian>(ev.stubs.len() as u32)?;
        for s in &ev.stubs {
            write_stub(w, s)?;
        }
    }
    Ok(())
}

fn write_stub<W: Write>(w: &mut W, s: &Stub) -> io::Result<()> {
    let mut flags = 0u8;
    if s.phi_b.is_some() {
        flags |= FLAG_PHI_B;
    }
    if s.r.is_some() {
        flags |= FLAG_R;
    }
    if s.region == Region::Endcap {
        flags |= FLAG_ENDCAP;
    }
    w.write_u8(s.layer)?;
    w.write_i32::<LittleEndian>(s.phi)?;
    w.write_u8(flags)?;
    w.write_i32::<LittleEndian>(s.phi_b.unwrap_or(0))?;
    w.write_i32::<LittleEndian>(s.eta)?;
    w.write_i32::<LittleEndian>(s.r.unwrap_or(0))?;
    w.write_u8(s.quality)?;
    w.write_i32::<LittleEndian>(s.bx)?;
    w.write_u8(s.cluster_size)
}

pub fn read_raw<R: Read>(r: &mut R) -> Result<Vec<Event>> {
    let mut magic = [0u8; 4];
    r.read_exact(&mut magic)?;
    if &magic != RAW_MAGIC {
        return Err(invalid("not a stub dump (bad magic)").into());
    }
    let version = r.read_u32::<LittleEndian>()?;
    if version != RAW_VERSION {
        return Err(invalid(&format!("unsupported stub dump version {}", version)).into());
    }

    let n_events = r.read_u32::<LittleEndian>()? as usize;
    let mut events = Vec::with_capacity(n_events.min(1 << 16));
    for _ in 0..n_events {
        let id = r.read_u64::<LittleEndian>()?;
        let truth = match r.read_u8()? {
            0 => None,
            1 => Some(TruthMuon {
                pt_class: r.read_u16::<LittleEndian>()?,
                charge: r.read_i8()?,
            }),
            other => return Err(invalid(&format!("event {}: bad truth flag {}", id, other)).into()),
        };
        let n_stubs = r.read_u32::<LittleEndian>()? as usize;
        let mut stubs = Vec::with_capacity(n_stubs.min(1 << 12));
        for _ in 0..n_stubs {
            stubs.push(read_stub(r)?);
        }
        events.push(Event { id, stubs, truth });
    }
    Ok(events)
}

fn read_stub<R: Read>(r: &mut R) -> io::Result<Stub> {
    let layer = r.read_u8()?;
    let phi = r.read_i32::<LittleEndian>()?;
    let flags = r.read_u8()?;
    let phi_b = r.read_i32::<LittleEndian>()?;
    let eta = r.read_i32::<LittleEndian>()?;
    let radius = r.read_i32::<LittleEndian>()?;
    let quality = r.read_u8()?;
    let bx = r.read_i32::<LittleEndian>()?;
    let cluster_size = r.read_u8()?;
    Ok(Stub {
        layer,
        phi,
        phi_b: (flags & FLAG_PHI_B != 0).then_some(phi_b),
        eta,
        r: (flags & FLAG_R != 0).then_some(radius),
        quality,
        bx,
        region: if flags & FLAG_ENDCAP != 0 { Region::Endcap } else { Region::Barrel },
        cluster_size,
    })
}

fn invalid(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.to_string())
}

pub fn save_raw(path: &Path, events: &[Event]) -> Result<()> {
    let mut w = BufWriter::new(File::create(path)?);
    write_raw(&mut w, events)?;
    w.flush()?;
    Ok(())
}

pub fn load_raw(path: &Path) -> Result<Vec<Event>> {
    let mut r = BufReader::new(open_input(path)?);
    read_raw(&mut r)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn events() -> Vec<Event> {
        vec![Event::new(
            42,
            vec![
                Stub::new(0, -17, 6, 0, Region::Barrel).with_phi_b(-300).with_eta(40),
                Stub::new(7, 2690, 1, 8, Region::Endcap).with_r(512),
            ],
        )
        .with_truth(TruthMuon { pt_class: 11, charge: 1 })]
    }

    #[test]
    fn test_layout() {
        let mut buf = Vec::new();
        write_raw(&mut buf, &events()).unwrap();
        // header + id + truth + stub count + stubs
        assert_eq!(buf.len(), 12 + 8 + 4 + 4 + 2 * RAW_STUB_SIZE);
        assert_eq!(&buf[..4], RAW_MAGIC);
        // first stub phi, little endian
        let first = 12 + 8 + 4 + 4;
        assert_eq!(&buf[first + 1..first + 5], &(-17i32).to_le_bytes());
    }

    #[test]
    fn test_read_back() {
        let mut buf = Vec::new();
        write_raw(&mut buf, &events()).unwrap();
        assert_eq!(read_raw(&mut Cursor::new(buf)).unwrap(), events());
    }

    #[test]
    fn test_truncated_and_bad_magic() {
        let mut buf = Vec::new();
        write_raw(&mut buf, &events()).unwrap();
        buf.truncate(buf.len() - 3);
        assert!(read_raw(&mut Cursor::new(buf.clone())).is_err());
        buf[0] = b'X';
        assert!(read_raw(&mut Cursor::new(buf)).is_err());
    }
}
