//
// Copyright (c) The Bfdd Contributors
//
// SPDX-License-Identifier: MIT
//

use std::sync::LazyLock as Lazy;

use bfdd::packet::{DecodeError, Packet, PacketFlags};
use bfdd_utils::bfd::State;

//
// Helper functions.
//

fn test_encode_packet(
    bytes_expected: &[u8],
    packet: &Result<Packet, DecodeError>,
) {
    let bytes_actual = packet.as_ref().unwrap().encode();
    assert_eq!(bytes_expected, bytes_actual.as_ref());
}

fn test_decode_packet(
    bytes: &[u8],
    packet_expected: &Result<Packet, DecodeError>,
) {
    let packet_actual = Packet::decode(bytes);
    assert_eq!(*packet_expected, packet_actual);
}

// Returns the base test packet with one byte patched.
fn patched(pos: usize, value: u8) -> Vec<u8> {
    let mut bytes = PACKET1.0.clone();
    bytes[pos] = value;
    bytes
}

//
// Test packets.
//

static PACKET1: Lazy<(Vec<u8>, Result<Packet, DecodeError>)> =
    Lazy::new(|| {
        (
            vec![
                0x20, 0xc0, 0x03, 0x18, 0x9f, 0xb2, 0x05, 0xd6, 0x4a, 0x23,
                0x57, 0xdc, 0x00, 0x04, 0x93, 0xe0, 0x00, 0x04, 0x93, 0xe0,
                0x00, 0x00, 0x00, 0x00,
            ],
            Ok(Packet {
                version: 1,
                diag: 0,
                state: State::Up,
                flags: PacketFlags::empty(),
                detect_mult: 3,
                my_discr: 0x9fb205d6,
                your_discr: 0x4a2357dc,
                desired_min_tx: 300000,
                req_min_rx: 300000,
                req_min_echo_rx: 0,
            }),
        )
    });

static PACKET2: Lazy<(Vec<u8>, Result<Packet, DecodeError>)> =
    Lazy::new(|| {
        (
            vec![
                0x21, 0x4a, 0x05, 0x18, 0x9f, 0xb2, 0x05, 0xd6, 0x00, 0x00,
                0x00, 0x00, 0x00, 0x0f, 0x42, 0x40, 0x00, 0x00, 0x27, 0x10,
                0x00, 0x00, 0x00, 0x00,
            ],
            Ok(Packet {
                version: 1,
                diag: 1,
                state: State::Down,
                flags: PacketFlags::D | PacketFlags::C,
                detect_mult: 5,
                my_discr: 0x9fb205d6,
                your_discr: 0,
                desired_min_tx: 1000000,
                req_min_rx: 10000,
                req_min_echo_rx: 0,
            }),
        )
    });

//
// Tests.
//

#[test]
fn test_encode_packet1() {
    let (ref bytes, ref packet) = *PACKET1;
    test_encode_packet(bytes, packet);
}

#[test]
fn test_decode_packet1() {
    let (ref bytes, ref packet) = *PACKET1;
    test_decode_packet(bytes, packet);
}

#[test]
fn test_encode_packet2() {
    let (ref bytes, ref packet) = *PACKET2;
    test_encode_packet(bytes, packet);
}

#[test]
fn test_decode_packet2() {
    let (ref bytes, ref packet) = *PACKET2;
    test_decode_packet(bytes, packet);
}

#[test]
fn test_decode_incomplete() {
    let bytes = &PACKET1.0[0..23];
    test_decode_packet(bytes, &Err(DecodeError::IncompletePacket));
}

#[test]
fn test_decode_length_mismatch() {
    // Header claims 23 bytes while the datagram has 24.
    let bytes = patched(3, 0x17);
    test_decode_packet(&bytes, &Err(DecodeError::InvalidPacketLength(0x17)));

    // Trailing garbage after the advertised length.
    let mut bytes = PACKET1.0.clone();
    bytes.push(0x00);
    test_decode_packet(&bytes, &Err(DecodeError::InvalidPacketLength(0x18)));
}

#[test]
fn test_decode_bad_version() {
    // Version 0.
    let bytes = patched(0, 0x00);
    test_decode_packet(&bytes, &Err(DecodeError::InvalidVersion(0)));

    // Version 2.
    let bytes = patched(0, 0x40);
    test_decode_packet(&bytes, &Err(DecodeError::InvalidVersion(2)));
}

#[test]
fn test_decode_bad_diagnostic() {
    let bytes = patched(0, 0x29);
    test_decode_packet(&bytes, &Err(DecodeError::InvalidDiagnostic(9)));
}

#[test]
fn test_decode_bad_detect_mult() {
    let bytes = patched(2, 0x00);
    test_decode_packet(&bytes, &Err(DecodeError::InvalidDetectMult(0)));
}

#[test]
fn test_decode_multipoint() {
    let bytes = patched(1, 0xc1);
    test_decode_packet(
        &bytes,
        &Err(DecodeError::InvalidFlags(PacketFlags::M)),
    );
}

#[test]
fn test_decode_poll_and_final() {
    let bytes = patched(1, 0xf0);
    test_decode_packet(
        &bytes,
        &Err(DecodeError::InvalidFlags(PacketFlags::P | PacketFlags::F)),
    );
}

#[test]
fn test_decode_authentication() {
    let bytes = patched(1, 0xc4);
    test_decode_packet(&bytes, &Err(DecodeError::AuthenticationUnsupported));
}

#[test]
fn test_decode_bad_my_discr() {
    let mut bytes = PACKET1.0.clone();
    bytes[4..8].copy_from_slice(&[0; 4]);
    test_decode_packet(&bytes, &Err(DecodeError::InvalidMyDiscriminator(0)));
}

#[test]
fn test_decode_bad_your_discr() {
    // Your Discriminator can only be zero while the sender is Down or
    // AdminDown.
    let mut bytes = PACKET1.0.clone();
    bytes[8..12].copy_from_slice(&[0; 4]);
    test_decode_packet(
        &bytes,
        &Err(DecodeError::InvalidYourDiscriminator(0)),
    );

    let mut bytes = patched(1, 0x80);
    bytes[8..12].copy_from_slice(&[0; 4]);
    test_decode_packet(
        &bytes,
        &Err(DecodeError::InvalidYourDiscriminator(0)),
    );

    let mut bytes = patched(1, 0x40);
    bytes[8..12].copy_from_slice(&[0; 4]);
    assert!(Packet::decode(&bytes).is_ok());
}
