// Jackson Coxson

use num_bigint::BigUint;
use rand::RngCore;
use sha2::{Digest, Sha512};
use zeroize::Zeroize;

use crate::RemoteXpcError;

/// Fixed serialized width of SRP public keys: the 3072-bit group's byte
/// length
pub const SRP_KEY_LENGTH: usize = 384;

/// Username fixed by the pair-setup protocol
pub const PAIR_SETUP_USERNAME: &str = "Pair-Setup";

/// RFC 5054 3072-bit group prime
const N_3072_HEX: &str = "\
FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD129024E088A67CC74\
020BBEA63B139B22514A08798E3404DDEF9519B3CD3A431B302B0A6DF25F1437\
4FE1356D6D51C245E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED\
EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE45B3DC2007CB8A163BF05\
98DA48361C55D39A69163FA8FD24CF5F83655D23DCA3AD961C62F356208552BB\
9ED529077096966D670C354E4ABC9804F1746C08CA18217C32905E462E36CE3B\
E39E772C180E86039B2783A2EC07A28FB5C55DF06F4C52C9DE2BCBF695581718\
3995497CEA956AE515D2261898FA051015728E5A8AAAC42DAD33170D04507A33\
A85521ABDF1CBA64ECFB850458DBEF0A8AEA71575D060C7DB3970F85A6E1E4C7\
ABF5AE8CDB0933D71E8C94E04A25619DCEE3D2261AD2EE6BF12FFA06D98A0864\
D87602733EC86A64521F2B18177B200CBBE117577A615D6C770988C0BAD946E2\
08E24FA074E5AB3143DB5BFCE0FD108E4B82D120A93AD2CAFFFFFFFFFFFFFFFF";

fn group_n() -> BigUint {
    BigUint::parse_bytes(N_3072_HEX.as_bytes(), 16).expect("group prime is well-formed")
}

fn group_g() -> BigUint {
    BigUint::from(5u8)
}

fn h(parts: &[&[u8]]) -> Vec<u8> {
    let mut hasher = Sha512::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().to_vec()
}

/// Serializes a group element as a fixed-width big-endian buffer
fn pad(value: &BigUint) -> Vec<u8> {
    let bytes = value.to_bytes_be();
    let mut out = vec![0u8; SRP_KEY_LENGTH.saturating_sub(bytes.len())];
    out.extend_from_slice(&bytes);
    out
}

/// `x = H(salt || H(username ":" password))`
fn compute_x(username: &str, password: &str, salt: &[u8]) -> BigUint {
    let identity = h(&[username.as_bytes(), b":", password.as_bytes()]);
    BigUint::from_bytes_be(&h(&[salt, &identity]))
}

/// `k = H(N || pad(g))`
fn compute_k(n: &BigUint, g: &BigUint) -> BigUint {
    BigUint::from_bytes_be(&h(&[&n.to_bytes_be(), &pad(g)]))
}

/// `M1 = H( H(N) XOR H(g) || H(I) || salt || pad(A) || pad(B) || K )`
fn compute_m1(
    n: &BigUint,
    g: &BigUint,
    username: &str,
    salt: &[u8],
    a_pub: &BigUint,
    b_pub: &BigUint,
    session_key: &[u8],
) -> Vec<u8> {
    let hn = h(&[&n.to_bytes_be()]);
    let hg = h(&[&g.to_bytes_be()]);
    let hxor: Vec<u8> = hn.iter().zip(hg.iter()).map(|(a, b)| a ^ b).collect();
    let hi = h(&[username.as_bytes()]);
    h(&[&hxor, &hi, salt, &pad(a_pub), &pad(b_pub), session_key])
}

/// `M2 = H( pad(A) || M1 || K )`
fn compute_m2(a_pub: &BigUint, m1: &[u8], session_key: &[u8]) -> Vec<u8> {
    h(&[&pad(a_pub), m1, session_key])
}

/// SRP-6a client for pair-setup
///
/// All hashes are SHA-512; the group is RFC 5054's 3072-bit prime with
/// g = 5. Dropping the client scrubs the private ephemeral and every
/// derived secret.
pub struct SrpClient {
    username: String,
    private_a: [u8; 32],
    a_pub: BigUint,
    session_key: Vec<u8>,
    m1: Vec<u8>,
    m2: Vec<u8>,
}

impl SrpClient {
    /// Creates a client with a fresh 32-byte random private ephemeral
    pub fn new() -> Self {
        let mut private_a = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut private_a);
        Self::with_private_key(private_a)
    }

    /// Creates a client from a known private ephemeral
    pub fn with_private_key(private_a: [u8; 32]) -> Self {
        let a = BigUint::from_bytes_be(&private_a);
        let a_pub = group_g().modpow(&a, &group_n());
        Self {
            username: PAIR_SETUP_USERNAME.to_string(),
            private_a,
            a_pub,
            session_key: Vec::new(),
            m1: Vec::new(),
            m2: Vec::new(),
        }
    }

    /// The public ephemeral `A = g^a mod N` as a 384-byte buffer
    pub fn public_key(&self) -> Vec<u8> {
        pad(&self.a_pub)
    }

    /// Processes the server's salt and public key, deriving the session
    /// key and the client proof `M1`
    ///
    /// # Errors
    /// Rejects a server public key congruent to zero and a zero scrambling
    /// parameter, both of which would let a bogus server fix the session
    /// key.
    pub fn process_challenge(
        &mut self,
        password: &str,
        salt: &[u8],
        server_public: &[u8],
    ) -> Result<Vec<u8>, RemoteXpcError> {
        let n = group_n();
        let g = group_g();

        let b_pub = BigUint::from_bytes_be(server_public);
        if (&b_pub % &n) == BigUint::from(0u8) {
            return Err(RemoteXpcError::Cryptography(
                "SRP server public key is out of range".to_string(),
            ));
        }

        let u = BigUint::from_bytes_be(&h(&[&pad(&self.a_pub), &pad(&b_pub)]));
        if u == BigUint::from(0u8) {
            return Err(RemoteXpcError::Cryptography(
                "SRP scrambling parameter is zero".to_string(),
            ));
        }

        let a = BigUint::from_bytes_be(&self.private_a);
        let x = compute_x(&self.username, password, salt);
        let k = compute_k(&n, &g);

        // S = (B - k·g^x) ^ (a + u·x) mod N
        let gx = g.modpow(&x, &n);
        let base = ((&b_pub % &n) + &n - ((&k * &gx) % &n)) % &n;
        let exponent = &a + &u * &x;
        let secret = base.modpow(&exponent, &n);

        self.session_key = h(&[&secret.to_bytes_be()]);
        self.m1 = compute_m1(
            &n,
            &g,
            &self.username,
            salt,
            &self.a_pub,
            &b_pub,
            &self.session_key,
        );
        self.m2 = compute_m2(&self.a_pub, &self.m1, &self.session_key);

        Ok(self.m1.clone())
    }

    /// The shared session key `K = H(S)`, once the challenge is processed
    pub fn session_key(&self) -> Option<&[u8]> {
        if self.session_key.is_empty() {
            None
        } else {
            Some(&self.session_key)
        }
    }

    /// The client proof `M1`, once the challenge is processed
    pub fn proof(&self) -> Option<&[u8]> {
        if self.m1.is_empty() {
            None
        } else {
            Some(&self.m1)
        }
    }

    /// Checks the server's proof `M2`
    pub fn verify_server_proof(&self, server_m2: &[u8]) -> bool {
        !self.m2.is_empty() && self.m2 == server_m2
    }
}

impl Default for SrpClient {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for SrpClient {
    fn drop(&mut self) {
        self.private_a.zeroize();
        self.session_key.zeroize();
        self.m1.zeroize();
        self.m2.zeroize();
    }
}
