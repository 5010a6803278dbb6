//! Page level differential encoding.
//!
//! Layout, all integers little endian:
//!
//! ```text
//! magic       8 bytes  "SQLBKDF1"
//! page_size   u32
//! base_len    u64
//! new_len     u64
//! records     (page_index u32, page bytes)*   until end of stream
//! ```
//!
//! A record holds every page of the new image that differs from, or does not
//! exist in, the base image. The last page may be shorter than `page_size`.

use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use std::io::Write;

pub static MAGIC: &[u8; 8] = b"SQLBKDF1";

/// Writes the pages of `new` that differ from `base`, returns the bytes written.
pub fn write_diff<W: Write>(base: &[u8], new: &[u8], page_size: usize, mut w: W) -> Result<u64> {
    if page_size == 0 {
        return Err(Error::engine("page size must not be zero"));
    }
    let page_index_limit = u32::MAX as usize;
    if new.len().div_ceil(page_size) > page_index_limit {
        return Err(Error::engine("database has too many pages for a differential backup"));
    }

    w.write_all(MAGIC)?;
    w.write_all(&(page_size as u32).to_le_bytes())?;
    w.write_all(&(base.len() as u64).to_le_bytes())?;
    w.write_all(&(new.len() as u64).to_le_bytes())?;
    let mut written = (MAGIC.len() + 4 + 8 + 8) as u64;

    for (idx, page) in new.chunks(page_size).enumerate() {
        let start = idx * page_size;
        let unchanged = base
            .get(start..start + page.len())
            .is_some_and(|base_page| base_page == page);
        if unchanged {
            continue;
        }
        w.write_all(&(idx as u32).to_le_bytes())?;
        w.write_all(page)?;
        written += 4 + page.len() as u64;
    }

    w.flush()?;
    Ok(written)
}

/// Rebuilds the new image from `base` and a stream produced by [`write_diff`].
#[cfg(test)]
pub(crate) fn apply_diff<R: std::io::Read>(base: &[u8], mut r: R) -> Result<Vec<u8>> {
    let mut magic = [0u8; 8];
    r.read_exact(&mut magic)?;
    if &magic != MAGIC {
        return Err(Error::engine("not a differential backup stream"));
    }
    let page_size = read_u32(&mut r)? as usize;
    let base_len = read_u64(&mut r)? as usize;
    let new_len = read_u64(&mut r)? as usize;
    if base_len != base.len() {
        return Err(Error::engine(format!(
            "base image is {} bytes, differential expects {}",
            base.len(),
            base_len
        )));
    }
    if page_size == 0 {
        return Err(Error::engine("page size must not be zero"));
    }

    let mut image = base.to_vec();
    image.resize(new_len, 0);
    let mut idx_buf = [0u8; 4];
    loop {
        match r.read_exact(&mut idx_buf) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e.into()),
        }
        let start = u32::from_le_bytes(idx_buf) as usize * page_size;
        let end = (start + page_size).min(new_len);
        if start >= end {
            return Err(Error::engine("page index out of range"));
        }
        r.read_exact(&mut image[start..end])?;
    }

    Ok(image)
}

#[cfg(test)]
fn read_u32<R: std::io::Read>(r: &mut R) -> Result<u32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

#[cfg(test)]
fn read_u64<R: std::io::Read>(r: &mut R) -> Result<u64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}
