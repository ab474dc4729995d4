//! Opaque string tokens for native handles and node identifiers.
//!
//! A token is a one-letter kind prefix followed by exactly sixteen lowercase hex digits of the
//! native address, e.g. `s00000000000010a0`. Node identifiers use the same scheme with the `i`
//! prefix.

use crate::native::NativeAddr;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

const ADDRESS_DIGITS: usize = 16;
const NODE_PREFIX: char = 'i';

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TokenKind {
    Engine,
    Scene,
    Renderer,
    Camera,
    Material,
    ViewState,
    Texture,
}

impl TokenKind {
    pub const ALL: [TokenKind; 7] = [
        TokenKind::Engine,
        TokenKind::Scene,
        TokenKind::Renderer,
        TokenKind::Camera,
        TokenKind::Material,
        TokenKind::ViewState,
        TokenKind::Texture,
    ];

    pub fn prefix(self) -> char {
        match self {
            TokenKind::Engine => 'e',
            TokenKind::Scene => 's',
            TokenKind::Renderer => 'r',
            TokenKind::Camera => 'c',
            TokenKind::Material => 'm',
            TokenKind::ViewState => 'v',
            TokenKind::Texture => 't',
        }
    }

    pub fn from_prefix(prefix: char) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.prefix() == prefix)
    }

    pub fn label(self) -> &'static str {
        match self {
            TokenKind::Engine => "engine",
            TokenKind::Scene => "scene",
            TokenKind::Renderer => "renderer",
            TokenKind::Camera => "camera",
            TokenKind::Material => "material",
            TokenKind::ViewState => "view-state",
            TokenKind::Texture => "texture",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TokenParseError {
    #[error("token '{0}' has an unknown kind prefix")]
    UnknownPrefix(String),
    #[error("token '{0}' must carry exactly 16 hex digits")]
    BadLength(String),
    #[error("token '{0}' contains non-hex characters")]
    BadDigits(String),
    #[error("token '{0}' encodes the null address")]
    NullAddress(String),
    #[error("token '{token}' is a {found} token, expected {expected}")]
    WrongKind { token: String, expected: &'static str, found: &'static str },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Token {
    kind: TokenKind,
    address: NativeAddr,
}

impl Token {
    pub fn new(kind: TokenKind, address: NativeAddr) -> Self {
        Self { kind, address }
    }

    pub fn kind(&self) -> TokenKind {
        self.kind
    }

    pub fn address(&self) -> NativeAddr {
        self.address
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{:016x}", self.kind.prefix(), self.address)
    }
}

impl FromStr for Token {
    type Err = TokenParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut chars = s.chars();
        let kind = chars
            .next()
            .and_then(TokenKind::from_prefix)
            .ok_or_else(|| TokenParseError::UnknownPrefix(s.to_string()))?;
        let address = parse_address(s, chars.as_str())?;
        Ok(Token { kind, address })
    }
}

fn parse_address(token: &str, digits: &str) -> Result<NativeAddr, TokenParseError> {
    if digits.len() != ADDRESS_DIGITS {
        return Err(TokenParseError::BadLength(token.to_string()));
    }
    if !digits.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(TokenParseError::BadDigits(token.to_string()));
    }
    let address =
        NativeAddr::from_str_radix(digits, 16).map_err(|_| TokenParseError::BadDigits(token.to_string()))?;
    if address == 0 {
        return Err(TokenParseError::NullAddress(token.to_string()));
    }
    Ok(address)
}

macro_rules! typed_token {
    ($(#[$meta:meta])* $name:ident, $kind:expr) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(Token);

        impl $name {
            pub const KIND: TokenKind = $kind;

            pub(crate) fn from_address(address: NativeAddr) -> Self {
                Self(Token::new($kind, address))
            }

            pub fn token(&self) -> Token {
                self.0
            }

            pub fn address(&self) -> NativeAddr {
                self.0.address()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }

        impl FromStr for $name {
            type Err = TokenParseError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let token: Token = s.parse()?;
                if token.kind() != $kind {
                    return Err(TokenParseError::WrongKind {
                        token: s.to_string(),
                        expected: $kind.label(),
                        found: token.kind().label(),
                    });
                }
                Ok(Self(token))
            }
        }

        impl From<$name> for Token {
            fn from(value: $name) -> Token {
                value.0
            }
        }
    };
}

typed_token!(
    /// An engine instance created for one client.
    EngineToken,
    TokenKind::Engine
);
typed_token!(
    /// A reference-counted scene.
    SceneToken,
    TokenKind::Scene
);
typed_token!(RendererToken, TokenKind::Renderer);
typed_token!(CameraToken, TokenKind::Camera);
typed_token!(MaterialToken, TokenKind::Material);
typed_token!(TextureToken, TokenKind::Texture);

/// Host-side identifier of a scene node (`i` + 16 hex digits).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn from_address(address: NativeAddr) -> Self {
        Self(format!("{NODE_PREFIX}{address:016x}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Native address of the node, or `None` when the identifier does not follow the pointer
    /// scheme. Malformed identifiers are never truncated into an address.
    pub fn address(&self) -> Option<NativeAddr> {
        let digits = self.0.strip_prefix(NODE_PREFIX)?;
        parse_address(&self.0, digits).ok()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(value: &str) -> Self {
        NodeId::new(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_encode_kind_and_address() {
        let token = Token::new(TokenKind::Scene, 0x10a0);
        assert_eq!(token.to_string(), "s00000000000010a0");
        assert_eq!("s00000000000010a0".parse::<Token>(), Ok(token));
        let renderer: RendererToken = "r00000000deadbeef".parse().expect("renderer token");
        assert_eq!(renderer.address(), 0xdead_beef);
    }

    #[test]
    fn typed_tokens_reject_other_kinds() {
        let err = "s00000000000010a0".parse::<RendererToken>().unwrap_err();
        assert!(matches!(err, TokenParseError::WrongKind { expected: "renderer", found: "scene", .. }));
    }

    #[test]
    fn malformed_tokens_are_rejected_not_truncated() {
        assert!(matches!("x00000000000010a0".parse::<Token>(), Err(TokenParseError::UnknownPrefix(_))));
        assert!(matches!("s00000000000010a0ff".parse::<Token>(), Err(TokenParseError::BadLength(_))));
        assert!(matches!("s10a0".parse::<Token>(), Err(TokenParseError::BadLength(_))));
        assert!(matches!("s00000000000010zz".parse::<Token>(), Err(TokenParseError::BadDigits(_))));
        assert!(matches!("s0000000000000000".parse::<Token>(), Err(TokenParseError::NullAddress(_))));
    }

    #[test]
    fn node_ids_decode_only_the_pointer_scheme() {
        let node = NodeId::from_address(0xabc);
        assert_eq!(node.as_str(), "i0000000000000abc");
        assert_eq!(node.address(), Some(0xabc));
        assert_eq!(NodeId::new("i0000000000000abc00").address(), None);
        assert_eq!(NodeId::new("n0000000000000abc").address(), None);
        assert_eq!(NodeId::new("i-000000000000abc").address(), None);
        assert_eq!(NodeId::new("camera-node").address(), None);
    }
}
