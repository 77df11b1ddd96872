// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Fuzz-style regression tests for texwind protocol framing.
// Author: Lukas Bower
#![forbid(unsafe_code)]

use std::panic::{catch_unwind, AssertUnwindSafe};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use texwind_wire::{
    decode_reply, decode_request, encode_reply, encode_request, PicCache, Reply, Request,
    RequestBody,
};

#[test]
fn fuzzed_request_frames_never_panic() {
    let iterations = std::env::var("TEXWIND_FUZZ_ITERS")
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(512);
    let mut rng = StdRng::seed_from_u64(0x7E0D_121E);

    for _ in 0..iterations {
        let mut frame = encode_request(&random_request(&mut rng));
        mutate_frame(&mut rng, &mut frame);
        let result = catch_unwind(AssertUnwindSafe(|| decode_request(&frame)));
        assert!(result.is_ok(), "request decoder panicked on mutated frame");
    }
}

#[test]
fn fuzzed_reply_frames_never_panic() {
    let iterations = std::env::var("TEXWIND_FUZZ_ITERS")
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(512);
    let mut rng = StdRng::seed_from_u64(0xD0C_0DE);

    for _ in 0..iterations {
        let mut frame = encode_reply(&random_reply(&mut rng));
        mutate_frame(&mut rng, &mut frame);
        let result = catch_unwind(AssertUnwindSafe(|| decode_reply(&frame)));
        assert!(result.is_ok(), "reply decoder panicked on mutated frame");
    }
}

fn mutate_frame<R: Rng>(rng: &mut R, frame: &mut Vec<u8>) {
    match rng.random_range(0..3) {
        0 => {
            if !frame.is_empty() {
                let idx = rng.random_range(0..frame.len());
                frame[idx] ^= rng.random_range(1..=0xFF);
            }
        }
        1 => {
            let new_len = rng.random_range(0..=frame.len());
            frame.truncate(new_len);
        }
        _ => {
            let tail_len = rng.random_range(1..16);
            let mut tail = vec![0u8; tail_len];
            rng.fill_bytes(&mut tail);
            frame.extend_from_slice(&tail);
        }
    }
}

fn random_request<R: Rng>(rng: &mut R) -> Request {
    let time_ms = rng.random_range(0..60_000);
    let body = match rng.random_range(0..9) {
        0 => RequestBody::Open {
            fid: rng.random_range(0..1024),
            path: random_path(rng),
            mode: if rng.random_bool(0.5) { "r" } else { "wb" }.into(),
        },
        1 => RequestBody::Read {
            fid: rng.random_range(0..1024),
            pos: rng.random(),
            size: rng.random_range(0..65_536),
        },
        2 => {
            let mut data = vec![0u8; rng.random_range(0..256)];
            rng.fill_bytes(&mut data);
            RequestBody::Write {
                fid: rng.random_range(-1..1024),
                pos: rng.random_range(0..1 << 20),
                data,
            }
        }
        3 => RequestBody::Close {
            fid: rng.random_range(0..1024),
        },
        4 => RequestBody::Size {
            fid: rng.random_range(0..1024),
        },
        5 => RequestBody::Seen {
            fid: rng.random_range(0..1024),
            pos: rng.random(),
        },
        6 => RequestBody::Gpic {
            path: random_path(rng),
            kind: rng.random_range(0..4),
            page: rng.random_range(0..64),
        },
        7 => RequestBody::Spic {
            path: random_path(rng),
            cache: PicCache {
                kind: rng.random_range(0..4),
                page: rng.random_range(0..64),
                bounds: [rng.random(), rng.random(), rng.random(), rng.random()],
            },
        },
        _ => RequestBody::Child { pid: rng.random() },
    };
    Request { time_ms, body }
}

fn random_reply<R: Rng>(rng: &mut R) -> Reply {
    match rng.random_range(0..7) {
        0 => Reply::Done,
        1 => Reply::Pass,
        2 => Reply::Fork,
        3 => Reply::Size(rng.random()),
        4 => {
            let mut data = vec![0u8; rng.random_range(0..256)];
            rng.fill_bytes(&mut data);
            Reply::Read(data)
        }
        5 => Reply::Open(random_path(rng).into_bytes()),
        _ => Reply::Gpic([rng.random(), rng.random(), rng.random(), rng.random()]),
    }
}

fn random_path<R: Rng>(rng: &mut R) -> String {
    const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz./_-";
    let len = rng.random_range(1..24);
    (0..len)
        .map(|_| ALPHABET[rng.random_range(0..ALPHABET.len())] as char)
        .collect()
}
