use num_enum::TryFromPrimitive;

/// The error codes a TURN client has to react to, along with their
/// recommended reason phrases:
///
/// 300  Try Alternate: The client should contact an alternate server for
///      this request.
///
/// 401  Unauthorized: The request did not contain the correct credentials
///      to proceed.  The client should retry the request with proper
///      credentials.
///
/// 403  Forbidden: The request was valid but cannot be performed due to
///      administrative or similar restrictions.
///
/// 437  Allocation Mismatch: A request was received by the server that
///      requires an allocation to be in place, but no allocation exists,
///      or a request was received that requires no allocation, but an
///      allocation exists.
///
/// 438  Stale Nonce: The NONCE used by the client was no longer valid.
///      The client should retry, using the NONCE provided in the
///      response.
///
/// 441  Wrong Credentials: The credentials in the (non-Allocate) request
///      do not match those used to create the allocation.
///
/// 486  Allocation Quota Reached: No more allocations using this username
///      can be created at the present time.
///
/// 508  Insufficient Capacity: The server is unable to carry out the
///      request due to some capacity limit being reached.
///
/// On the wire the hundreds digit is carried separately from the
/// remainder, which is what the packing below reproduces.
const fn errno(code: u16) -> u16 {
    ((code / 100) << 8) | (code % 100)
}

#[repr(u16)]
#[derive(PartialEq, Eq, Copy, Clone, Debug, Hash, TryFromPrimitive)]
pub enum ErrorKind {
    TryAlternate = errno(300),
    BadRequest = errno(400),
    Unauthorized = errno(401),
    Forbidden = errno(403),
    UnknownAttribute = errno(420),
    AllocationMismatch = errno(437),
    StaleNonce = errno(438),
    AddressFamilyNotSupported = errno(440),
    WrongCredentials = errno(441),
    UnsupportedTransportAddress = errno(442),
    PeerAddressFamilyMismatch = errno(443),
    AllocationQuotaReached = errno(486),
    ServerError = errno(500),
    InsufficientCapacity = errno(508),
}

impl ErrorKind {
    /// The conventional decimal code, 300-699.
    ///
    /// # Test
    ///
    /// ```
    /// use turn_client_codec::message::attributes::error::ErrorKind;
    ///
    /// assert_eq!(ErrorKind::TryAlternate.code(), 300);
    /// assert_eq!(ErrorKind::StaleNonce.code(), 438);
    /// ```
    pub const fn code(&self) -> u16 {
        let value = *self as u16;
        (value >> 8) * 100 + (value & 0xFF)
    }

    /// Recover the kind from the wire packing of class and number.
    pub fn from_wire(value: u16) -> Option<Self> {
        Self::try_from(value).ok()
    }
}

impl From<ErrorKind> for &'static str {
    /// # Test
    ///
    /// ```
    /// use turn_client_codec::message::attributes::error::ErrorKind;
    ///
    /// let err: &'static str = ErrorKind::TryAlternate.into();
    /// assert_eq!(err, "Try Alternate");
    /// ```
    #[rustfmt::skip]
    fn from(val: ErrorKind) -> Self {
        match val {
            ErrorKind::TryAlternate => "Try Alternate",
            ErrorKind::BadRequest => "Bad Request",
            ErrorKind::Unauthorized => "Unauthorized",
            ErrorKind::Forbidden => "Forbidden",
            ErrorKind::UnknownAttribute => "Unknown Attribute",
            ErrorKind::AllocationMismatch => "Allocation Mismatch",
            ErrorKind::StaleNonce => "Stale Nonce",
            ErrorKind::AddressFamilyNotSupported => "Address Family not Supported",
            ErrorKind::WrongCredentials => "Wrong Credentials",
            ErrorKind::UnsupportedTransportAddress => "Unsupported Transport Address",
            ErrorKind::PeerAddressFamilyMismatch => "Peer Address Family Mismatch",
            ErrorKind::AllocationQuotaReached => "Allocation Quota Reached",
            ErrorKind::ServerError => "Server Error",
            ErrorKind::InsufficientCapacity => "Insufficient Capacity",
        }
    }
}
