use crate::conn::Conn;

// -----------------------------------------------------------------------------
//     - Codec -
// -----------------------------------------------------------------------------
/// Stream-to-frame translation, pluggable per engine instance.
///
/// `decode` inspects the connection's inbound buffer and either consumes and
/// returns exactly one complete frame or returns `None`, leaving every byte
/// in place. It must be safe to call again as more bytes accumulate:
/// repeated calls over partial deliveries must yield the same frames a
/// single full delivery would.
pub trait Codec: Send + Sync {
    fn encode(&self, conn: &Conn, buf: &[u8]) -> Vec<u8>;
    fn decode(&self, conn: &mut Conn) -> Option<Vec<u8>>;
}

// -----------------------------------------------------------------------------
//     - Built-in codec -
// -----------------------------------------------------------------------------
/// Pass-through codec treating the raw stream as already framed: whatever
/// is buffered is the frame.
pub struct BuiltInFrameCodec;

impl Codec for BuiltInFrameCodec {
    fn encode(&self, _conn: &Conn, buf: &[u8]) -> Vec<u8> {
        buf.to_vec()
    }

    fn decode(&self, conn: &mut Conn) -> Option<Vec<u8>> {
        if conn.buffer_length() == 0 {
            return None;
        }
        Some(conn.inbound_buffer_mut().take_all())
    }
}

// -----------------------------------------------------------------------------
//     - Length-field codec -
// -----------------------------------------------------------------------------
/// Frames prefixed with a big-endian u32 payload length.
pub struct LengthFieldCodec;

impl Codec for LengthFieldCodec {
    fn encode(&self, _conn: &Conn, buf: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + buf.len());
        out.extend_from_slice(&(buf.len() as u32).to_be_bytes());
        out.extend_from_slice(buf);
        out
    }

    fn decode(&self, conn: &mut Conn) -> Option<Vec<u8>> {
        let inbound = conn.inbound_buffer_mut();
        if inbound.len() < 4 {
            return None;
        }

        let mut header = [0u8; 4];
        {
            let (a, b) = inbound.peek();
            for (i, slot) in header.iter_mut().enumerate() {
                *slot = if i < a.len() { a[i] } else { b[i - a.len()] };
            }
        }

        let frame_len = u32::from_be_bytes(header) as usize;
        if inbound.len() < 4 + frame_len {
            return None;
        }

        let mut frame = inbound.read_n(4 + frame_len)?;
        frame.drain(..4);
        Some(frame)
    }
}

#[cfg(test)]
mod tests {
    use rand::Rng;

    use super::*;
    use crate::conn::tests::buffer_conn;

    fn frames() -> Vec<Vec<u8>> {
        vec![
            b"first".to_vec(),
            vec![],
            vec![0xAB; 300],
            b"tail".to_vec(),
        ]
    }

    #[test]
    fn length_field_round_trip_in_one_delivery() {
        let codec = LengthFieldCodec;
        let (_poller, mut conn) = buffer_conn();

        let mut wire = Vec::new();
        for frame in frames() {
            wire.extend_from_slice(&codec.encode(&conn, &frame));
        }
        conn.inbound_buffer_mut().write_all(&wire);

        let mut decoded = Vec::new();
        while let Some(frame) = codec.decode(&mut conn) {
            decoded.push(frame);
        }
        assert_eq!(decoded, frames());
        assert_eq!(conn.buffer_length(), 0);
    }

    #[test]
    fn length_field_decode_is_resumable_over_random_chunks() {
        let codec = LengthFieldCodec;
        let mut rng = rand::thread_rng();

        for _ in 0..50 {
            let (_poller, mut conn) = buffer_conn();

            let mut wire = Vec::new();
            for frame in frames() {
                wire.extend_from_slice(&codec.encode(&conn, &frame));
            }

            // Deliver the stream in arbitrary partial chunks, decoding
            // after every delivery.
            let mut decoded = Vec::new();
            let mut offset = 0;
            while offset < wire.len() {
                let chunk = rng.gen_range(1..=wire.len() - offset);
                conn.inbound_buffer_mut()
                    .write_all(&wire[offset..offset + chunk]);
                offset += chunk;

                while let Some(frame) = codec.decode(&mut conn) {
                    decoded.push(frame);
                }
            }

            assert_eq!(decoded, frames());
        }
    }

    #[test]
    fn incomplete_frame_leaves_bytes_untouched() {
        let codec = LengthFieldCodec;
        let (_poller, mut conn) = buffer_conn();

        let wire = codec.encode(&conn, b"payload");
        conn.inbound_buffer_mut().write_all(&wire[..wire.len() - 1]);

        assert!(codec.decode(&mut conn).is_none());
        assert_eq!(conn.buffer_length(), wire.len() - 1);
    }

    #[test]
    fn built_in_codec_hands_over_the_raw_stream() {
        let codec = BuiltInFrameCodec;
        let (_poller, mut conn) = buffer_conn();

        assert!(codec.decode(&mut conn).is_none());

        conn.inbound_buffer_mut().write_all(b"raw bytes");
        assert_eq!(codec.decode(&mut conn).unwrap(), b"raw bytes");
        assert_eq!(conn.buffer_length(), 0);
    }
}
