//! Property-based tests for Tether
//!
//! Uses proptest to verify invariants across large input spaces.

use proptest::prelude::*;

// ============================================================================
// Framer Properties
// ============================================================================

mod frame_properties {
    use super::*;
    use tether_core::{Command, Frame, FrameReader, FrameWriter};

    fn command() -> impl Strategy<Value = Command> {
        prop_oneof![
            Just(Command::Invoke),
            Just(Command::Get),
            Just(Command::Response),
            Just(Command::Cancel),
            Just(Command::Error),
        ]
    }

    proptest! {
        /// Arbitrary input never panics the reader; it yields frames,
        /// a clean end, or an error
        #[test]
        fn reader_survives_garbage(input in prop::collection::vec(any::<u8>(), 0..2048)) {
            let mut reader = FrameReader::new(input.as_slice(), true);
            for _ in 0..64 {
                match reader.read_frame() {
                    Ok(Some(_)) => continue,
                    Ok(None) | Err(_) => break,
                }
            }
        }

        /// Header values with line breaks cannot inject extra headers
        #[test]
        fn header_values_cannot_inject_lines(
            value in "[a-z\r\n: ]{0,40}",
            name in "[a-z]{1,10}",
        ) {
            let frame = Frame::new(Command::Invoke)
                .arg(1)
                .arg("target")
                .header(name.clone(), value);
            let wire = frame.encode();
            let mut reader = FrameReader::new(wire.as_slice(), true);

            let decoded = reader.read_frame().unwrap().unwrap();
            prop_assert_eq!(decoded.headers().len(), 1);
            prop_assert!(decoded.header_value(&name).is_some());
            prop_assert!(reader.read_frame().unwrap().is_none());
        }

        /// Consecutive frames decode in order with payloads attached
        #[test]
        fn frame_sequence_preserved(
            frames in prop::collection::vec(
                (command(), "[a-z0-9]{1,12}", prop::collection::vec(any::<u8>(), 0..300)),
                1..12,
            ),
            buffered in any::<bool>(),
        ) {
            let mut writer = FrameWriter::new(Vec::new());
            for (command, arg, payload) in &frames {
                writer.write_frame(&Frame::new(*command).arg(arg)).unwrap();
                writer
                    .write_frame_with_payload(&Frame::new(Command::Data).arg(7).arg(payload.len()), payload)
                    .unwrap();
            }

            let wire = writer.into_inner();
            let mut reader = FrameReader::new(wire.as_slice(), buffered);
            for (command, arg, payload) in &frames {
                let frame = reader.read_frame().unwrap().unwrap();
                prop_assert_eq!(frame.command(), *command);
                prop_assert_eq!(frame.arg_str(0).unwrap(), arg.as_str());

                let data = reader.read_frame().unwrap().unwrap();
                prop_assert_eq!(data.command(), Command::Data);
                let size: usize = data.parse_arg(1).unwrap();
                prop_assert_eq!(&reader.read_payload(size).unwrap(), payload);
            }
            prop_assert!(reader.read_frame().unwrap().is_none());
        }
    }
}

// ============================================================================
// Cipher Stream Properties
// ============================================================================

mod cipher_properties {
    use super::*;
    use std::io::{Read, Write};
    use tether_core::stream::{CipherReader, CipherWriter};
    use tether_crypto::CipherKey;

    proptest! {
        /// How writes and reads are chunked never changes the bytes seen
        #[test]
        fn chunking_invariance(
            data in prop::collection::vec(any::<u8>(), 1..4096),
            write_sizes in prop::collection::vec(1usize..512, 1..16),
            read_size in 1usize..700,
            key in any::<[u8; 32]>(),
            iv in any::<[u8; 16]>(),
        ) {
            let key = CipherKey::new(key, iv);

            let mut writer = CipherWriter::new(Vec::new(), &key);
            let mut rest = data.as_slice();
            for size in write_sizes.iter().cycle() {
                if rest.is_empty() {
                    break;
                }
                let (head, tail) = rest.split_at((*size).min(rest.len()));
                writer.write_all(head).unwrap();
                rest = tail;
            }
            let wire = writer.get_ref().clone();
            prop_assert_eq!(wire.len(), data.len());

            let mut reader = CipherReader::new(wire.as_slice(), &key);
            let mut decoded = Vec::new();
            let mut buf = vec![0u8; read_size];
            loop {
                let n = reader.read(&mut buf).unwrap();
                if n == 0 {
                    break;
                }
                decoded.extend_from_slice(&buf[..n]);
            }
            prop_assert_eq!(decoded, data);
        }
    }
}

// ============================================================================
// Identity Properties
// ============================================================================

mod identity_properties {
    use super::*;
    use tether_core::{Identifier, Peering};

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        /// Each side's peering is the other side's remote peering
        #[test]
        fn peering_symmetry(
            secret in prop::collection::vec(any::<u8>(), 1..64),
            a in "[a-z]{1,12}",
            b in "[a-z]{1,12}",
        ) {
            let left = Peering::derive(&secret, &a, &b);
            let right = Peering::derive(&secret, &b, &a);
            prop_assert_eq!(&left.peering, &right.remote_peering);
            prop_assert_eq!(&left.remote_peering, &right.peering);
        }
    }

    proptest! {
        /// Display output parses back to the same identifier
        #[test]
        fn identifier_text_form(digest in any::<[u8; 32]>(), instance in "[a-z0-9-]{0,16}") {
            let mut bytes = [0u8; 64];
            bytes[..32].copy_from_slice(&digest);
            bytes[32..].copy_from_slice(&digest);
            let mut id = Identifier::new(bytes);
            if !instance.is_empty() {
                id = id.with_instance(instance);
            }
            let parsed: Identifier = id.to_string().parse().unwrap();
            prop_assert_eq!(parsed, id);
        }
    }
}

// ============================================================================
// Content Channel Properties
// ============================================================================

mod content_properties {
    use super::*;
    use std::io::Read;
    use tether_core::content::content_channel;

    proptest! {
        /// A body pushed in arbitrary chunks reads back byte for byte
        #[test]
        fn content_reassembles_chunks(
            chunks in prop::collection::vec(prop::collection::vec(any::<u8>(), 1..256), 0..24),
        ) {
            let (sink, mut content) = content_channel();
            for chunk in &chunks {
                prop_assert!(sink.push(chunk.clone()));
            }
            sink.finish();

            let mut received = Vec::new();
            content.read_to_end(&mut received).unwrap();
            prop_assert_eq!(received, chunks.concat());
        }
    }
}
