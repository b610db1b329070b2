use anyhow::bail;
use bytes::{Buf, BufMut, Bytes};
use uuid::Uuid;

use crate::util::safe_converter::{PrecheckedCast, SafeCast};

const ABSENT: u8 = 0;
const PRESENT: u8 = 1;


pub fn put_bytes(buf: &mut impl BufMut, data: &[u8]) {
    buf.put_u32(data.len().prechecked_cast());
    buf.put_slice(data);
}

pub fn try_get_bytes(buf: &mut impl Buf) -> anyhow::Result<Bytes> {
    let len: usize = buf.try_get_u32()?.safe_cast();
    if buf.remaining() < len {
        bail!("length prefix {} exceeds the remaining {} bytes", len, buf.remaining());
    }
    Ok(buf.copy_to_bytes(len))
}

pub fn put_string(buf: &mut impl BufMut, s: &str) {
    put_bytes(buf, s.as_bytes());
}

pub fn try_get_string(buf: &mut impl Buf) -> anyhow::Result<String> {
    let raw = try_get_bytes(buf)?;
    let s = String::from_utf8(raw.to_vec())?;
    Ok(s)
}

pub fn put_opt_string(buf: &mut impl BufMut, s: Option<&str>) {
    match s {
        None => buf.put_u8(ABSENT),
        Some(s) => {
            buf.put_u8(PRESENT);
            put_string(buf, s);
        }
    }
}

pub fn try_get_opt_string(buf: &mut impl Buf) -> anyhow::Result<Option<String>> {
    match buf.try_get_u8()? {
        ABSENT => Ok(None),
        PRESENT => Ok(Some(try_get_string(buf)?)),
        other => bail!("invalid presence flag {}", other),
    }
}

pub fn put_uuid(buf: &mut impl BufMut, id: &Uuid) {
    buf.put_slice(id.as_bytes());
}

pub fn try_get_uuid(buf: &mut impl Buf) -> anyhow::Result<Uuid> {
    let mut raw = [0u8; 16];
    if buf.remaining() < raw.len() {
        bail!("buffer underflow reading a message id");
    }
    buf.copy_to_slice(&mut raw);
    Ok(Uuid::from_bytes(raw))
}

#[cfg(test)]
mod test {
    use super::*;
    use bytes::BytesMut;
    use rstest::rstest;

    #[rstest]
    #[case::empty("")]
    #[case::ascii("hello")]
    #[case::multibyte("grüße 😀")]
    fn test_string(#[case] s: &str) {
        let mut buf = BytesMut::new();
        put_string(&mut buf, s);
        assert_eq!(buf.len(), 4 + s.len());

        let mut b: &[u8] = &buf;
        assert_eq!(try_get_string(&mut b).unwrap(), s);
        assert!(b.is_empty());
    }

    #[rstest]
    #[case::none(None)]
    #[case::some(Some("smsc-1"))]
    fn test_opt_string(#[case] s: Option<&str>) {
        let mut buf = BytesMut::new();
        put_opt_string(&mut buf, s);

        let mut b: &[u8] = &buf;
        assert_eq!(try_get_opt_string(&mut b).unwrap().as_deref(), s);
        assert!(b.is_empty());
    }

    #[rstest]
    #[case::no_length(vec![0, 0])]
    #[case::truncated(vec![0, 0, 0, 5, b'a', b'b'])]
    #[case::invalid_utf8(vec![0, 0, 0, 2, 0xc3, 0x28])]
    fn test_string_invalid(#[case] raw: Vec<u8>) {
        let mut b: &[u8] = &raw;
        assert!(try_get_string(&mut b).is_err());
    }

    #[test]
    fn test_opt_string_invalid_flag() {
        let mut b: &[u8] = &[7, 0, 0, 0, 0];
        assert!(try_get_opt_string(&mut b).is_err());
    }

    #[test]
    fn test_uuid() {
        let id = Uuid::new_v4();
        let mut buf = BytesMut::new();
        put_uuid(&mut buf, &id);
        buf.put_u8(99);

        let mut b: &[u8] = &buf;
        assert_eq!(try_get_uuid(&mut b).unwrap(), id);
        assert_eq!(b, &[99]);

        let mut short: &[u8] = &[1, 2, 3];
        assert!(try_get_uuid(&mut short).is_err());
    }
}
