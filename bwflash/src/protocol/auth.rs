//! Brightway challenge/response signing.
//!
//! The bootloader authenticates the update host with two 16-byte
//! challenges (one per direction). Both sides derive a 176-byte key
//! schedule from the device UID using a substitution table and round
//! constants embedded in the firmware image, then run the challenge
//! through ten substitution/rotation/mix rounds. The mix step doubles
//! each byte in GF(2^8) (XOR 0x1B on overflow), so the scheme behaves
//! like a hardware-friendly AES variant keyed by the UID.
//!
//! All functions here are pure and deterministic; the signing tables are
//! extracted from the image by [`crate::firmware::FirmwareImage::signing_tables`].

use crate::firmware::SigningTables;

/// Length of the expanded key schedule: 11 round keys of 16 bytes.
const KEY_SCHEDULE_LEN: usize = 176;

/// Expand the 16-byte UID into the 176-byte key schedule.
fn expand_key(uid: &[u8; 16], tables: &SigningTables) -> [u8; KEY_SCHEDULE_LEN] {
    let mut key = [0u8; KEY_SCHEDULE_LEN];
    key[..16].copy_from_slice(uid);

    let mut local = [0u8; 4];
    for j in (16..KEY_SCHEDULE_LEN).step_by(4) {
        let (prev, rest) = key.split_at_mut(j);
        rest[..4].copy_from_slice(&prev[j - 16..j - 12]);

        if j % 16 != 0 {
            local.copy_from_slice(&prev[j - 4..j]);
        } else {
            // Every 16 bytes: rotate, substitute and fold in the round constant.
            local = [
                tables.subst[prev[j - 3] as usize] ^ tables.rounds[j / 16],
                tables.subst[prev[j - 2] as usize],
                tables.subst[prev[j - 1] as usize],
                tables.subst[prev[j - 4] as usize],
            ];
        }
        for i in 0..4 {
            key[j + i] ^= local[i];
        }
    }
    key
}

/// XOR one 16-byte round key from the schedule into `state`.
fn add_round_key(state: &mut [u8; 16], schedule: &[u8; KEY_SCHEDULE_LEN], round: usize) {
    for j in round * 16..(round + 1) * 16 {
        state[j % 16] ^= schedule[j];
    }
}

/// Column-mixing step: GF(2^8) doubling of pairwise XOR terms.
fn mix_columns(state: &mut [u8; 16]) {
    for offset in (0..16).step_by(4) {
        let t0 = state[offset] ^ state[offset + 1];
        let t1 = state[offset + 1] ^ state[offset + 2];
        let t2 = state[offset + 2] ^ state[offset + 3];
        let t3 = state[offset + 3] ^ state[offset];
        let fold = t0 ^ t2;

        for (i, t) in [t0, t1, t2, t3].into_iter().enumerate() {
            let doubled = (t << 1) ^ if t & 0x80 != 0 { 0x1B } else { 0x00 };
            state[offset + i] ^= doubled ^ fold;
        }
    }
}

/// Rotate the values at `indices` one position forward.
fn roll_bytes<const N: usize>(state: &mut [u8; 16], indices: [usize; N]) {
    let first = state[indices[0]];
    for w in 0..N - 1 {
        state[indices[w]] = state[indices[w + 1]];
    }
    state[indices[N - 1]] = first;
}

/// Row-shifting step shared by every round.
fn shift_rows(state: &mut [u8; 16]) {
    roll_bytes(state, [1, 5, 9, 13]);
    roll_bytes(state, [2, 10]);
    roll_bytes(state, [3, 15, 11, 7]);
    roll_bytes(state, [6, 14]);
}

/// Sign a 16-byte challenge with the key derived from `uid`.
pub fn sign_challenge(uid: &[u8; 16], challenge: &[u8; 16], tables: &SigningTables) -> [u8; 16] {
    let schedule = expand_key(uid, tables);

    let mut state = *challenge;
    for round in 0..10 {
        if round > 0 {
            mix_columns(&mut state);
        }
        add_round_key(&mut state, &schedule, round);
        for byte in state.iter_mut() {
            *byte = tables.subst[*byte as usize];
        }
        shift_rows(&mut state);
    }
    add_round_key(&mut state, &schedule, 10);

    state
}

#[cfg(test)]
mod tests {
    use super::*;

    /// The deterministic tables baked into the test fixture images:
    /// subst[i] = (i * 7 + 3) & 0xFF, rounds[i] = (i * 31 + 5) & 0xFF.
    fn fixture_tables() -> SigningTables {
        let mut subst = [0u8; 256];
        for (i, slot) in subst.iter_mut().enumerate() {
            *slot = ((i * 7 + 3) & 0xFF) as u8;
        }
        let mut rounds = [0u8; 11];
        for (i, slot) in rounds.iter_mut().enumerate().skip(1) {
            *slot = ((i * 31 + 5) & 0xFF) as u8;
        }
        SigningTables { subst, rounds }
    }

    fn uid() -> [u8; 16] {
        *b"foobarfoobar1337"
    }

    #[test]
    fn test_sign_challenge_reference_vector() {
        let challenge: [u8; 16] = std::array::from_fn(|i| (i + 1) as u8);
        let signed = sign_challenge(&uid(), &challenge, &fixture_tables());
        // Known-good output for this UID/challenge/table combination.
        let expected: [u8; 16] = [
            0x26, 0xAC, 0xFC, 0xD7, 0x93, 0x64, 0x6E, 0x44, 0x4E, 0x22, 0x54, 0xE1, 0xEF, 0x9A,
            0x9C, 0x25,
        ];
        assert_eq!(signed, expected);
    }

    #[test]
    fn test_sign_challenge_second_vector() {
        let challenge: [u8; 16] = std::array::from_fn(|i| (16 - i) as u8);
        let signed = sign_challenge(&uid(), &challenge, &fixture_tables());
        let expected: [u8; 16] = [
            0x91, 0xE5, 0x2B, 0x28, 0xCC, 0x56, 0x84, 0x70, 0xAA, 0xCB, 0x53, 0x6D, 0x3C, 0x72,
            0x02, 0xD3,
        ];
        assert_eq!(signed, expected);
    }

    #[test]
    fn test_sign_challenge_deterministic() {
        let challenge = [0x42u8; 16];
        let tables = fixture_tables();
        assert_eq!(
            sign_challenge(&uid(), &challenge, &tables),
            sign_challenge(&uid(), &challenge, &tables)
        );
    }

    #[test]
    fn test_sign_challenge_sensitive_to_inputs() {
        let tables = fixture_tables();
        let challenge = [0x42u8; 16];
        let mut other_challenge = challenge;
        other_challenge[0] ^= 1;
        assert_ne!(
            sign_challenge(&uid(), &challenge, &tables),
            sign_challenge(&uid(), &other_challenge, &tables)
        );

        let mut other_uid = uid();
        other_uid[15] ^= 1;
        assert_ne!(
            sign_challenge(&uid(), &challenge, &tables),
            sign_challenge(&other_uid, &challenge, &tables)
        );
    }
}
