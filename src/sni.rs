//! TLS ClientHello parsing for SNI-based routing
//!
//! The HTTPS vhost never terminates TLS; it only needs the server name from
//! the first handshake record to pick a back end, then replays every byte.

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

const RECORD_HANDSHAKE: u8 = 0x16;
const HANDSHAKE_CLIENT_HELLO: u8 = 0x01;
const EXTENSION_SERVER_NAME: u16 = 0x0000;
const SNI_HOSTNAME: u8 = 0x00;
const MAX_RECORD_LEN: usize = 16 * 1024 + 256;

/// Read the first TLS record from `stream`. Returns the raw record bytes
/// (header included, for replay) and the SNI host name if one is present.
pub async fn read_client_hello<S>(stream: &mut S) -> std::io::Result<(Bytes, Option<String>)>
where
    S: AsyncRead + Unpin,
{
    let mut header = [0u8; 5];
    stream.read_exact(&mut header).await?;
    if header[0] != RECORD_HANDSHAKE {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "not a TLS handshake record",
        ));
    }
    let record_len = u16::from_be_bytes([header[3], header[4]]) as usize;
    if record_len == 0 || record_len > MAX_RECORD_LEN {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("TLS record length {} out of range", record_len),
        ));
    }

    let mut record = vec![0u8; record_len];
    stream.read_exact(&mut record).await?;

    let sni = extract_sni(&record);

    let mut raw = BytesMut::with_capacity(5 + record_len);
    raw.extend_from_slice(&header);
    raw.extend_from_slice(&record);
    Ok((raw.freeze(), sni))
}

/// Walk a ClientHello handshake message and pull out the SNI host name.
pub fn extract_sni(handshake: &[u8]) -> Option<String> {
    let mut cursor = Cursor::new(handshake);

    if cursor.take_u8()? != HANDSHAKE_CLIENT_HELLO {
        return None;
    }
    let body_len = cursor.take_u24()? as usize;
    let mut body = Cursor::new(cursor.take_slice(body_len)?);

    body.skip(2)?; // legacy version
    body.skip(32)?; // random
    let session_id_len = body.take_u8()? as usize;
    body.skip(session_id_len)?;
    let cipher_suites_len = body.take_u16()? as usize;
    body.skip(cipher_suites_len)?;
    let compression_len = body.take_u8()? as usize;
    body.skip(compression_len)?;

    let extensions_len = body.take_u16()? as usize;
    let mut extensions = Cursor::new(body.take_slice(extensions_len)?);
    while extensions.remaining() >= 4 {
        let ext_type = extensions.take_u16()?;
        let ext_len = extensions.take_u16()? as usize;
        let ext_data = extensions.take_slice(ext_len)?;
        if ext_type != EXTENSION_SERVER_NAME {
            continue;
        }
        let mut sni = Cursor::new(ext_data);
        let list_len = sni.take_u16()? as usize;
        let mut names = Cursor::new(sni.take_slice(list_len)?);
        while names.remaining() >= 3 {
            let name_type = names.take_u8()?;
            let name_len = names.take_u16()? as usize;
            let name = names.take_slice(name_len)?;
            if name_type == SNI_HOSTNAME {
                return std::str::from_utf8(name).ok().map(|s| s.to_lowercase());
            }
        }
    }
    None
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn take_u8(&mut self) -> Option<u8> {
        let b = *self.data.get(self.pos)?;
        self.pos += 1;
        Some(b)
    }

    fn take_u16(&mut self) -> Option<u16> {
        let s = self.take_slice(2)?;
        Some(u16::from_be_bytes([s[0], s[1]]))
    }

    fn take_u24(&mut self) -> Option<u32> {
        let s = self.take_slice(3)?;
        Some(u32::from_be_bytes([0, s[0], s[1], s[2]]))
    }

    fn take_slice(&mut self, n: usize) -> Option<&'a [u8]> {
        if self.remaining() < n {
            return None;
        }
        let s = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Some(s)
    }

    fn skip(&mut self, n: usize) -> Option<()> {
        self.take_slice(n).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build a minimal ClientHello handshake message carrying `host` as SNI.
    fn client_hello_with_sni(host: &str) -> Vec<u8> {
        let name = host.as_bytes();
        let mut sni_entry = vec![SNI_HOSTNAME];
        sni_entry.extend_from_slice(&(name.len() as u16).to_be_bytes());
        sni_entry.extend_from_slice(name);

        let mut sni_ext = Vec::new();
        sni_ext.extend_from_slice(&(sni_entry.len() as u16).to_be_bytes());
        sni_ext.extend_from_slice(&sni_entry);

        let mut extensions = Vec::new();
        extensions.extend_from_slice(&EXTENSION_SERVER_NAME.to_be_bytes());
        extensions.extend_from_slice(&(sni_ext.len() as u16).to_be_bytes());
        extensions.extend_from_slice(&sni_ext);

        let mut body = Vec::new();
        body.extend_from_slice(&[0x03, 0x03]); // version
        body.extend_from_slice(&[0u8; 32]); // random
        body.push(0); // session id
        body.extend_from_slice(&2u16.to_be_bytes()); // one cipher suite
        body.extend_from_slice(&[0x13, 0x01]);
        body.push(1); // compression methods
        body.push(0);
        body.extend_from_slice(&(extensions.len() as u16).to_be_bytes());
        body.extend_from_slice(&extensions);

        let mut handshake = vec![HANDSHAKE_CLIENT_HELLO];
        handshake.extend_from_slice(&(body.len() as u32).to_be_bytes()[1..]);
        handshake.extend_from_slice(&body);
        handshake
    }

    fn wrap_record(handshake: &[u8]) -> Vec<u8> {
        let mut record = vec![RECORD_HANDSHAKE, 0x03, 0x01];
        record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
        record.extend_from_slice(handshake);
        record
    }

    #[test]
    fn test_extract_sni() {
        let hello = client_hello_with_sni("secure.example.com");
        assert_eq!(extract_sni(&hello).as_deref(), Some("secure.example.com"));
    }

    #[test]
    fn test_sni_is_lowercased() {
        let hello = client_hello_with_sni("Secure.Example.COM");
        assert_eq!(extract_sni(&hello).as_deref(), Some("secure.example.com"));
    }

    #[test]
    fn test_no_sni_extension() {
        let mut body = Vec::new();
        body.extend_from_slice(&[0x03, 0x03]);
        body.extend_from_slice(&[0u8; 32]);
        body.push(0);
        body.extend_from_slice(&2u16.to_be_bytes());
        body.extend_from_slice(&[0x13, 0x01]);
        body.push(1);
        body.push(0);
        body.extend_from_slice(&0u16.to_be_bytes());

        let mut handshake = vec![HANDSHAKE_CLIENT_HELLO];
        handshake.extend_from_slice(&(body.len() as u32).to_be_bytes()[1..]);
        handshake.extend_from_slice(&body);

        assert_eq!(extract_sni(&handshake), None);
    }

    #[test]
    fn test_not_client_hello() {
        assert_eq!(extract_sni(&[0x02, 0x00, 0x00, 0x00]), None);
        assert_eq!(extract_sni(&[]), None);
    }

    #[test]
    fn test_truncated_hello() {
        let mut hello = client_hello_with_sni("example.com");
        hello.truncate(hello.len() / 2);
        assert_eq!(extract_sni(&hello), None);
    }

    #[tokio::test]
    async fn test_read_client_hello_replays_raw_bytes() {
        let record = wrap_record(&client_hello_with_sni("app.example.com"));
        let (mut tx, mut rx) = tokio::io::duplex(4096);
        tokio::io::AsyncWriteExt::write_all(&mut tx, &record)
            .await
            .unwrap();

        let (raw, sni) = read_client_hello(&mut rx).await.unwrap();
        assert_eq!(sni.as_deref(), Some("app.example.com"));
        assert_eq!(&raw[..], &record[..]);
    }

    #[tokio::test]
    async fn test_read_client_hello_rejects_non_tls() {
        let (mut tx, mut rx) = tokio::io::duplex(256);
        tokio::io::AsyncWriteExt::write_all(&mut tx, b"GET / HTTP/1.1\r\n\r\n")
            .await
            .unwrap();
        assert!(read_client_hello(&mut rx).await.is_err());
    }
}
