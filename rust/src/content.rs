//! Content-stream framing: how a fetched `FILE` object's temp file is
//! split into payload, file-info, and extended attributes before being
//! handed to the store's content-staging pipeline.
//!
//! ```text
//! u32 LE   payload_len
//! payload bytes
//! u32 LE   mode
//! u8       has_mtime (0 or 1)
//! u64 LE   mtime                 (present only if has_mtime == 1)
//! u32 LE   xattr_count
//! xattr_count * { u16 LE name_len, name bytes, u32 LE value_len, value bytes }
//! ```

use crate::error::{PullError, PullResult};
use crate::store::{ContentInput, FileInfo};

pub fn parse_content_stream(bytes: &[u8]) -> PullResult<ContentInput> {
    let mut pos = 0usize;
    let take = |pos: &mut usize, n: usize| -> PullResult<std::ops::Range<usize>> {
        if *pos + n > bytes.len() {
            return Err(PullError::Store("truncated content stream".into()));
        }
        let r = *pos..*pos + n;
        *pos += n;
        Ok(r)
    };

    let r = take(&mut pos, 4)?;
    let payload_len = u32::from_le_bytes(bytes[r].try_into().unwrap()) as usize;
    let r = take(&mut pos, payload_len)?;
    let payload = bytes[r].to_vec();

    let r = take(&mut pos, 4)?;
    let mode = u32::from_le_bytes(bytes[r].try_into().unwrap());

    let r = take(&mut pos, 1)?;
    let has_mtime = bytes[r][0] != 0;
    let mtime = if has_mtime {
        let r = take(&mut pos, 8)?;
        Some(u64::from_le_bytes(bytes[r].try_into().unwrap()))
    } else {
        None
    };

    let r = take(&mut pos, 4)?;
    let xattr_count = u32::from_le_bytes(bytes[r].try_into().unwrap());
    let mut xattrs = Vec::with_capacity(xattr_count as usize);
    for _ in 0..xattr_count {
        let r = take(&mut pos, 2)?;
        let name_len = u16::from_le_bytes(bytes[r].try_into().unwrap()) as usize;
        let r = take(&mut pos, name_len)?;
        let name = String::from_utf8(bytes[r].to_vec())
            .map_err(|e| PullError::Store(format!("non-utf8 xattr name: {e}")))?;
        let r = take(&mut pos, 4)?;
        let value_len = u32::from_le_bytes(bytes[r].try_into().unwrap()) as usize;
        let r = take(&mut pos, value_len)?;
        let value = bytes[r].to_vec();
        xattrs.push((name, value));
    }

    Ok(ContentInput {
        payload,
        file_info: FileInfo { mode, mtime },
        xattrs,
    })
}

pub fn encode_content_stream(input: &ContentInput) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&(input.payload.len() as u32).to_le_bytes());
    out.extend_from_slice(&input.payload);
    out.extend_from_slice(&input.file_info.mode.to_le_bytes());
    match input.file_info.mtime {
        Some(mtime) => {
            out.push(1);
            out.extend_from_slice(&mtime.to_le_bytes());
        }
        None => out.push(0),
    }
    out.extend_from_slice(&(input.xattrs.len() as u32).to_le_bytes());
    for (name, value) in &input.xattrs {
        out.extend_from_slice(&(name.len() as u16).to_le_bytes());
        out.extend_from_slice(name.as_bytes());
        out.extend_from_slice(&(value.len() as u32).to_le_bytes());
        out.extend_from_slice(value);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_with_xattrs() {
        let input = ContentInput {
            payload: b"hello world".to_vec(),
            file_info: FileInfo {
                mode: 0o100644,
                mtime: Some(1_700_000_000),
            },
            xattrs: vec![("user.note".to_string(), b"abc".to_vec())],
        };
        let bytes = encode_content_stream(&input);
        let parsed = parse_content_stream(&bytes).unwrap();
        assert_eq!(parsed.payload, input.payload);
        assert_eq!(parsed.file_info.mode, input.file_info.mode);
        assert_eq!(parsed.file_info.mtime, input.file_info.mtime);
        assert_eq!(parsed.xattrs, input.xattrs);
    }

    #[test]
    fn round_trips_without_mtime_or_xattrs() {
        let input = ContentInput {
            payload: b"".to_vec(),
            file_info: FileInfo {
                mode: 0,
                mtime: None,
            },
            xattrs: vec![],
        };
        let bytes = encode_content_stream(&input);
        let parsed = parse_content_stream(&bytes).unwrap();
        assert_eq!(parsed.payload, input.payload);
        assert!(parsed.xattrs.is_empty());
    }

    #[test]
    fn truncated_stream_is_rejected() {
        let input = ContentInput {
            payload: b"data".to_vec(),
            file_info: FileInfo {
                mode: 0,
                mtime: None,
            },
            xattrs: vec![],
        };
        let mut bytes = encode_content_stream(&input);
        bytes.truncate(bytes.len() - 2);
        assert!(parse_content_stream(&bytes).is_err());
    }
}
