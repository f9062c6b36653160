use rand::Rng;

pub const INVITE_CODE_LEN: usize = 6;

/// Upper-case letters and digits without the easily confused 0/O and 1/I.
const INVITE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

/// A fresh random invite code. Uniqueness is checked by the store.
pub fn generate() -> String {
    let mut rng = rand::rng();
    (0..INVITE_CODE_LEN)
        .map(|_| INVITE_ALPHABET[rng.random_range(0..INVITE_ALPHABET.len())] as char)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_use_the_invite_alphabet() {
        for _ in 0..100 {
            let code = generate();
            assert_eq!(code.len(), INVITE_CODE_LEN);
            assert!(code.bytes().all(|b| INVITE_ALPHABET.contains(&b)));
        }
    }
}
