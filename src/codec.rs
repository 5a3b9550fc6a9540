//! Datagram framing and transport coding.
//!
//! A datagram is a fixed 24-byte big-endian header followed by an opaque
//! payload, protected by a CRC32 (IEEE) computed over the whole frame with
//! the checksum field zeroed. Frames travel inside carrier text, so the
//! binary frame is transport-coded with base85 in one of two alphabets:
//! an ASCII set and a non-ASCII set for carriers that tolerate (or expect)
//! national-script text. The decoder picks the alphabet by looking for
//! non-ASCII code points.

use thiserror::Error;

/// Wire length of the fixed header: version u16, checksum u32, device i64,
/// session i32, number i32, command i16.
pub const HEADER_LEN: usize = 24;

/// Encoded length of a payload-less frame, in characters.
pub const HEADER_ENCODED_LEN: usize = 30;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("undecodable transport coding")]
    BadEncoding,
    #[error("frame shorter than header")]
    Truncated,
    #[error("checksum mismatch")]
    Checksum,
    #[error("malformed payload")]
    BadPayload,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Connect,
    Forward,
    Close,
    Retry,
    Other(i16),
}

impl Command {
    pub fn code(self) -> i16 {
        match self {
            Command::Connect => 1,
            Command::Forward => 2,
            Command::Close => 3,
            Command::Retry => 4,
            Command::Other(code) => code,
        }
    }

    pub fn from_code(code: i16) -> Self {
        match code {
            1 => Command::Connect,
            2 => Command::Forward,
            3 => Command::Close,
            4 => Command::Retry,
            other => Command::Other(other),
        }
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Command::Connect => write!(f, "connect"),
            Command::Forward => write!(f, "forward"),
            Command::Close => write!(f, "close"),
            Command::Retry => write!(f, "retry"),
            Command::Other(code) => write!(f, "cmd({code})"),
        }
    }
}

/// One frame of the tunnel protocol.
///
/// The checksum is a wire artifact: it is computed on encode and verified
/// (then discarded) on decode, so two datagrams compare equal iff their
/// meaningful fields do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    pub version: u16,
    pub device: i64,
    pub session: i32,
    pub number: i32,
    pub command: Command,
    pub payload: Vec<u8>,
}

impl Datagram {
    pub fn new(device: i64, session: i32, number: i32, command: Command, payload: Vec<u8>) -> Self {
        Self {
            version: 1,
            device,
            session,
            number,
            command,
            payload,
        }
    }

    /// A version-zero sentinel frame, used as a padding caption so a peer
    /// can tell authentic carrier items from unrelated platform noise.
    pub fn padding(device: i64) -> Self {
        Self {
            version: 0,
            device,
            session: 0,
            number: 0,
            command: Command::Other(0),
            payload: Vec::new(),
        }
    }

    pub fn is_zero(&self) -> bool {
        self.version == 0
    }

    pub fn is_loopback(&self, device: i64) -> bool {
        self.device == device
    }

    pub fn len(&self) -> usize {
        HEADER_LEN + self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Transport-coded length in characters, independent of alphabet.
    pub fn encoded_len(&self) -> usize {
        5 * self.len().div_ceil(4)
    }

    pub fn encode(&self, alphabet: Alphabet) -> String {
        let mut data = Vec::with_capacity(self.len());

        data.extend_from_slice(&self.version.to_be_bytes());
        data.extend_from_slice(&0u32.to_be_bytes());
        data.extend_from_slice(&self.device.to_be_bytes());
        data.extend_from_slice(&self.session.to_be_bytes());
        data.extend_from_slice(&self.number.to_be_bytes());
        data.extend_from_slice(&self.command.code().to_be_bytes());
        data.extend_from_slice(&self.payload);

        let crc = crc32fast::hash(&data);
        data[2..6].copy_from_slice(&crc.to_be_bytes());

        base85_encode(&data, alphabet)
    }

    pub fn decode(s: &str) -> Result<Self, CodecError> {
        let alphabet = detect_alphabet(s);
        let mut data = base85_decode(s, alphabet)?;

        if data.len() < HEADER_LEN {
            return Err(CodecError::Truncated);
        }

        let version = u16::from_be_bytes([data[0], data[1]]);
        let sum = u32::from_be_bytes([data[2], data[3], data[4], data[5]]);
        let device = i64::from_be_bytes(data[6..14].try_into().unwrap());
        let session = i32::from_be_bytes(data[14..18].try_into().unwrap());
        let number = i32::from_be_bytes(data[18..22].try_into().unwrap());
        let command = i16::from_be_bytes([data[22], data[23]]);
        let payload = data[HEADER_LEN..].to_vec();

        data[2..6].fill(0);

        if sum != crc32fast::hash(&data) {
            return Err(CodecError::Checksum);
        }

        Ok(Self {
            version,
            device,
            session,
            number,
            command: Command::from_code(command),
            payload,
        })
    }
}

impl std::fmt::Display for Datagram {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "ver={} dev={} ses={} num={} cmd={} pld={}",
            self.version,
            self.device % 1000,
            self.session,
            self.number,
            self.command,
            self.payload.len(),
        )
    }
}

/// Largest decoded byte count that fits in `encoded_limit` characters of
/// base85. Exact on 5-character boundaries, conservatively rounded below
/// them (a partial trailing group always has room for one short word).
pub fn max_decoded_len(encoded_limit: usize) -> usize {
    if encoded_limit % 5 == 0 {
        return encoded_limit / 5 * 4;
    }

    let scaled = encoded_limit * 4;

    if scaled <= 20 {
        return 0;
    }

    (scaled - 20).div_ceil(5)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Alphabet {
    /// RFC 1924 character set, safe for URL-ish and plain-text carriers.
    Ascii,
    /// Cyrillic substitution set for carriers where ASCII walls of symbols
    /// would stand out more than national-script text.
    Wide,
}

const ASCII_ALPHABET: &[char; 85] = &[
    '0', '1', '2', '3', '4', '5', '6', '7', '8', '9', 'A', 'B', 'C', 'D', 'E', 'F', 'G', 'H', 'I',
    'J', 'K', 'L', 'M', 'N', 'O', 'P', 'Q', 'R', 'S', 'T', 'U', 'V', 'W', 'X', 'Y', 'Z', 'a', 'b',
    'c', 'd', 'e', 'f', 'g', 'h', 'i', 'j', 'k', 'l', 'm', 'n', 'o', 'p', 'q', 'r', 's', 't', 'u',
    'v', 'w', 'x', 'y', 'z', '!', '#', '$', '%', '&', '(', ')', '*', '+', '-', ';', '<', '=', '>',
    '?', '@', '^', '_', '`', '{', '|', '}', '~',
];

const WIDE_ALPHABET: &[char; 85] = &[
    'А', 'Б', 'В', 'Г', 'Д', 'Е', 'Ж', 'З', 'И', 'Й', 'К', 'Л', 'М', 'Н', 'О', 'П', 'Р', 'С', 'Т',
    'У', 'Ф', 'Х', 'Ц', 'Ч', 'Ш', 'Щ', 'Ъ', 'Ы', 'Ь', 'Э', 'Ю', 'Я', 'а', 'б', 'в', 'г', 'д', 'е',
    'ж', 'з', 'и', 'й', 'к', 'л', 'м', 'н', 'о', 'п', 'р', 'с', 'т', 'у', 'ф', 'х', 'ц', 'ч', 'ш',
    'щ', 'ъ', 'ы', 'ь', 'э', 'ю', 'я', 'Ё', 'ё', 'Ђ', 'ђ', 'Ѓ', 'ѓ', 'Є', 'є', 'Ѕ', 'ѕ', 'І', 'і',
    'Ї', 'ї', 'Ј', 'ј', 'Љ', 'љ', 'Њ', 'њ', 'Ћ',
];

fn detect_alphabet(s: &str) -> Alphabet {
    if s.bytes().any(|b| b >= 0x80) {
        Alphabet::Wide
    } else {
        Alphabet::Ascii
    }
}

fn alphabet_chars(alphabet: Alphabet) -> &'static [char; 85] {
    match alphabet {
        Alphabet::Ascii => ASCII_ALPHABET,
        Alphabet::Wide => WIDE_ALPHABET,
    }
}

fn digit_of(c: char, alphabet: Alphabet) -> Option<u32> {
    alphabet_chars(alphabet)
        .iter()
        .position(|&a| a == c)
        .map(|i| i as u32)
}

/// Plain base85: each 4-byte big-endian word becomes five digits, most
/// significant first. A trailing word of n bytes is zero-padded and emitted
/// as its n+1 leading digits. No all-zero abbreviation, so encoded length
/// is a pure function of input length.
fn base85_encode(data: &[u8], alphabet: Alphabet) -> String {
    let chars = alphabet_chars(alphabet);
    let mut out = String::with_capacity(data.len().div_ceil(4) * 5 * 2);

    for chunk in data.chunks(4) {
        let mut word = [0u8; 4];
        word[..chunk.len()].copy_from_slice(chunk);

        let mut value = u32::from_be_bytes(word);
        let mut digits = [0u32; 5];

        for digit in digits.iter_mut().rev() {
            *digit = value % 85;
            value /= 85;
        }

        for &digit in digits.iter().take(chunk.len() + 1) {
            out.push(chars[digit as usize]);
        }
    }

    out
}

fn base85_decode(s: &str, alphabet: Alphabet) -> Result<Vec<u8>, CodecError> {
    let digits = s
        .chars()
        .map(|c| digit_of(c, alphabet).ok_or(CodecError::BadEncoding))
        .collect::<Result<Vec<u32>, _>>()?;

    let mut out = Vec::with_capacity(digits.len() / 5 * 4 + 4);

    for group in digits.chunks(5) {
        if group.len() == 1 {
            return Err(CodecError::BadEncoding);
        }

        // A truncated group is padded with the maximum digit so the kept
        // high bytes survive the encoder's low-digit truncation.
        let mut value: u64 = 0;

        for i in 0..5 {
            let digit = group.get(i).copied().unwrap_or(84);
            value = value * 85 + u64::from(digit);
        }

        if value > u64::from(u32::MAX) {
            return Err(CodecError::BadEncoding);
        }

        let word = (value as u32).to_be_bytes();
        out.extend_from_slice(&word[..group.len() - 1]);
    }

    Ok(out)
}

/// CONNECT payload: host bytes followed by a big-endian port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectPayload {
    pub host: String,
    pub port: u16,
}

impl ConnectPayload {
    pub fn encode(&self) -> Vec<u8> {
        let mut data = self.host.as_bytes().to_vec();
        data.extend_from_slice(&self.port.to_be_bytes());

        data
    }

    pub fn decode(data: &[u8]) -> Result<Self, CodecError> {
        if data.len() < 2 {
            return Err(CodecError::BadPayload);
        }

        let (host, port) = data.split_at(data.len() - 2);
        let host = String::from_utf8(host.to_vec()).map_err(|_| CodecError::BadPayload)?;

        Ok(Self {
            host,
            port: u16::from_be_bytes([port[0], port[1]]),
        })
    }

    pub fn address(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

/// RETRY payload: the sequence number being asked for again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPayload {
    pub number: i32,
}

impl RetryPayload {
    pub fn encode(&self) -> Vec<u8> {
        self.number.to_be_bytes().to_vec()
    }

    pub fn decode(data: &[u8]) -> Result<Self, CodecError> {
        if data.len() < 4 {
            return Err(CodecError::BadPayload);
        }

        Ok(Self {
            number: i32::from_be_bytes([data[0], data[1], data[2], data[3]]),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Datagram {
        Datagram::new(42, 7, 1, Command::Forward, vec![0xDE, 0xAD, 0xBE, 0xEF])
    }

    #[test]
    fn roundtrip_both_alphabets() {
        let dg = sample();

        for alphabet in [Alphabet::Ascii, Alphabet::Wide] {
            let encoded = dg.encode(alphabet);
            let decoded = Datagram::decode(&encoded).unwrap();
            assert_eq!(decoded, dg);
        }
    }

    #[test]
    fn roundtrip_empty_payload() {
        let dg = Datagram::new(1, 2, 3, Command::Close, Vec::new());
        let encoded = dg.encode(Alphabet::Ascii);

        assert_eq!(encoded.chars().count(), HEADER_ENCODED_LEN);
        assert_eq!(Datagram::decode(&encoded).unwrap(), dg);
    }

    #[test]
    fn roundtrip_all_payload_lengths() {
        for n in 0..64usize {
            let dg = Datagram::new(-5, 9, n as i32, Command::Forward, vec![0xA5; n]);

            for alphabet in [Alphabet::Ascii, Alphabet::Wide] {
                let encoded = dg.encode(alphabet);
                assert_eq!(encoded.chars().count(), dg.encoded_len());
                assert_eq!(Datagram::decode(&encoded).unwrap(), dg);
            }
        }
    }

    #[test]
    fn alphabet_detection() {
        let dg = sample();

        assert!(dg.encode(Alphabet::Ascii).is_ascii());
        assert!(!dg.encode(Alphabet::Wide).is_ascii());
    }

    #[test]
    fn bit_flip_rejected() {
        let encoded = sample().encode(Alphabet::Ascii);

        for i in 0..encoded.len() {
            let mut mutated: Vec<char> = encoded.chars().collect();
            let replacement = if mutated[i] == '0' { '1' } else { '0' };
            mutated[i] = replacement;
            let mutated: String = mutated.into_iter().collect();

            assert!(Datagram::decode(&mutated).is_err(), "index {i} accepted");
        }
    }

    #[test]
    fn foreign_character_rejected() {
        let mut encoded = sample().encode(Alphabet::Ascii);
        encoded.push(',');

        assert_eq!(Datagram::decode(&encoded), Err(CodecError::BadEncoding));
    }

    #[test]
    fn truncated_frame_rejected() {
        let encoded = sample().encode(Alphabet::Ascii);
        let short: String = encoded.chars().take(10).collect();

        assert!(Datagram::decode(&short).is_err());
    }

    #[test]
    fn padding_is_zero_and_loopback() {
        let dg = Datagram::padding(99);

        assert!(dg.is_zero());
        assert!(dg.is_loopback(99));
        assert!(!dg.is_loopback(98));

        let decoded = Datagram::decode(&dg.encode(Alphabet::Ascii)).unwrap();
        assert!(decoded.is_zero());
    }

    #[test]
    fn max_decoded_len_math() {
        assert_eq!(max_decoded_len(30), 24);
        assert_eq!(max_decoded_len(4066), 3249);
        assert_eq!(max_decoded_len(4065), 3252);
        assert_eq!(max_decoded_len(5), 4);
        assert_eq!(max_decoded_len(2), 0);

        // The computed budget always fits the claimed limit.
        for limit in 30..200usize {
            let payload = max_decoded_len(limit - HEADER_ENCODED_LEN);
            let dg = Datagram::new(1, 1, 1, Command::Forward, vec![0; payload]);
            assert!(dg.encoded_len() <= limit, "limit {limit}");
        }
    }

    #[test]
    fn connect_payload_roundtrip() {
        let pld = ConnectPayload {
            host: "example.com".into(),
            port: 443,
        };

        assert_eq!(ConnectPayload::decode(&pld.encode()).unwrap(), pld);
        assert_eq!(pld.address(), "example.com:443");
        assert!(ConnectPayload::decode(&[0x01]).is_err());

        let v6 = ConnectPayload {
            host: "::1".into(),
            port: 80,
        };
        assert_eq!(v6.address(), "[::1]:80");
    }

    #[test]
    fn retry_payload_roundtrip() {
        let pld = RetryPayload { number: 7 };

        assert_eq!(RetryPayload::decode(&pld.encode()).unwrap(), pld);
        assert!(RetryPayload::decode(&[0, 0, 1]).is_err());
    }

    #[test]
    fn command_codes() {
        for code in [1i16, 2, 3, 4, 0, 99] {
            assert_eq!(Command::from_code(code).code(), code);
        }
    }
}
