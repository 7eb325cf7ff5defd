//! Property tests for the framing layer.

use assuan_relay::framing::{
    detect_completion, extract_inquire_block, extract_inquire_reply, extract_line, parse_descriptor, validate_inquire_lines,
    ResponseKind, INQUIRE_TERMINATOR, NONCE_LEN,
};
use proptest::prelude::*;

/// A `D` or `S` line that carries no terminal marker at its start
fn data_line() -> impl Strategy<Value = Vec<u8>> {
    ("[DS]", "[ -~]{0,40}").prop_map(|(tag, body)| format!("{tag} {body}\n").into_bytes())
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

proptest! {
    #[test]
    fn descriptor_accepts_any_port_and_nonce(port in 1u16.., nonce in any::<[u8; NONCE_LEN]>()) {
        let mut bytes = format!("{port}\n").into_bytes();
        bytes.extend_from_slice(&nonce);

        let desc = parse_descriptor(&bytes).unwrap();
        prop_assert_eq!(desc.port, port);
        prop_assert_eq!(desc.nonce.as_bytes(), &nonce);
    }

    #[test]
    fn descriptor_rejects_wrong_nonce_length(
        port in 1u16..,
        nonce in prop::collection::vec(any::<u8>(), 0..64)
            .prop_filter("nonce of the right length", |n| n.len() != NONCE_LEN),
    ) {
        let mut bytes = format!("{port}\n").into_bytes();
        bytes.extend_from_slice(&nonce);
        prop_assert!(parse_descriptor(&bytes).is_err());
    }

    #[test]
    fn descriptor_never_panics(bytes in prop::collection::vec(any::<u8>(), 0..64)) {
        let _ = parse_descriptor(&bytes);
    }

    #[test]
    fn data_lines_alone_never_complete(lines in prop::collection::vec(data_line(), 0..8)) {
        let buffer = lines.concat();
        let completion = detect_completion(&buffer);
        prop_assert!(!completion.complete);
        prop_assert_eq!(completion.kind, None);
    }

    #[test]
    fn terminal_line_completes_after_data(
        lines in prop::collection::vec(data_line(), 0..8),
        marker in prop_oneof![
            Just((&b"OK\n"[..], ResponseKind::Ok)),
            Just((&b"OK done\n"[..], ResponseKind::Ok)),
            Just((&b"ERR 67108881 Bad passphrase\n"[..], ResponseKind::Err)),
            Just((&b"INQUIRE PASSPHRASE\n"[..], ResponseKind::Inquire)),
        ],
    ) {
        let mut buffer = lines.concat();
        buffer.extend_from_slice(marker.0);

        let completion = detect_completion(&buffer);
        prop_assert!(completion.complete);
        prop_assert_eq!(completion.kind, Some(marker.1));
    }

    #[test]
    fn unterminated_buffer_is_incomplete(
        lines in prop::collection::vec(data_line(), 0..4),
        tail in "OK[ -~]{0,10}",
    ) {
        let mut buffer = lines.concat();
        buffer.extend_from_slice(tail.as_bytes());
        prop_assert!(!detect_completion(&buffer).complete);
    }

    #[test]
    fn extract_line_splits_at_first_newline(buffer in prop::collection::vec(any::<u8>(), 0..128)) {
        let out = extract_line(&buffer);
        let unit = out.extracted.unwrap_or_default();
        prop_assert_eq!([unit, out.remaining].concat(), buffer.clone());

        match out.extracted {
            Some(unit) => {
                prop_assert_eq!(unit.last(), Some(&b'\n'));
                prop_assert_eq!(unit.iter().filter(|&&b| b == b'\n').count(), 1);
            },
            None => prop_assert!(!buffer.contains(&b'\n')),
        }
    }

    #[test]
    fn extract_inquire_block_stops_at_first_end(
        lines in prop::collection::vec(data_line(), 0..6),
        rest in prop::collection::vec(any::<u8>(), 0..32),
    ) {
        let mut buffer = lines.concat();
        buffer.extend_from_slice(INQUIRE_TERMINATOR);
        buffer.extend_from_slice(&rest);

        let out = extract_inquire_block(&buffer);
        let unit = out.extracted.unwrap();
        prop_assert!(unit.ends_with(INQUIRE_TERMINATOR));
        prop_assert!(!contains(&unit[..unit.len() - 1], INQUIRE_TERMINATOR));
        prop_assert_eq!([unit, out.remaining].concat(), buffer.clone());
    }

    #[test]
    fn inquire_reply_ends_only_at_a_whole_end_line(
        bodies in prop::collection::vec("[ -~]{0,40}(END)?", 0..6),
        rest in prop::collection::vec(any::<u8>(), 0..32),
    ) {
        let reply: Vec<u8> = bodies
            .iter()
            .flat_map(|body| format!("D {body}\n").into_bytes())
            .chain(INQUIRE_TERMINATOR.iter().copied())
            .collect();
        let buffer = [reply.as_slice(), rest.as_slice()].concat();

        let out = extract_inquire_reply(&buffer);
        prop_assert_eq!(out.extracted, Some(reply.as_slice()));
        prop_assert_eq!(out.remaining, rest.as_slice());
    }

    #[test]
    fn inquire_reply_of_d_lines_validates(bodies in prop::collection::vec("[ -~]{0,40}", 0..6)) {
        let mut buffer: Vec<u8> = bodies
            .iter()
            .flat_map(|body| format!("D {body}\n").into_bytes())
            .collect();
        buffer.extend_from_slice(INQUIRE_TERMINATOR);
        prop_assert!(validate_inquire_lines(&buffer).is_ok());
    }

    #[test]
    fn command_inside_inquire_reply_is_rejected(
        bodies in prop::collection::vec("[ -~]{0,20}", 0..4),
        command in "[A-CE-Z][A-Z]{2,8}",
    ) {
        let mut buffer: Vec<u8> = bodies
            .iter()
            .flat_map(|body| format!("D {body}\n").into_bytes())
            .collect();
        buffer.extend_from_slice(format!("{command}\n").as_bytes());
        prop_assume!(command != "END");
        prop_assert!(validate_inquire_lines(&buffer).is_err());
    }
}
