use crate::Error;

/// STUN Methods Registry
///
/// [RFC5389]: https://datatracker.ietf.org/doc/html/rfc5389
/// [RFC5766]: https://datatracker.ietf.org/doc/html/rfc5766
///
/// A stun method is a hex number in the range 0x000-0x0FF; the class of
/// the message (request, success response, error response, indication) is
/// folded into bits 4 and 8 of the leading u16 on the wire.
///
/// The methods a TURN client exchanges with its server:
///
/// 0x001: Binding
/// 0x003: Allocate
/// 0x004: Refresh
/// 0x006: Send
/// 0x007: Data
/// 0x008: CreatePermission
/// 0x009: ChannelBind
#[derive(PartialEq, Eq, Hash, Debug, Clone, Copy)]
pub enum Kind {
    Request,
    Response,
    Error,
}

#[derive(PartialEq, Eq, Hash, Debug, Clone, Copy)]
pub enum Method {
    Binding(Kind),
    Allocate(Kind),
    CreatePermission(Kind),
    ChannelBind(Kind),
    Refresh(Kind),
    SendIndication,
    DataIndication,
}

pub const BINDING_REQUEST: Method = Method::Binding(Kind::Request);
pub const BINDING_RESPONSE: Method = Method::Binding(Kind::Response);
pub const BINDING_ERROR: Method = Method::Binding(Kind::Error);
pub const ALLOCATE_REQUEST: Method = Method::Allocate(Kind::Request);
pub const ALLOCATE_RESPONSE: Method = Method::Allocate(Kind::Response);
pub const ALLOCATE_ERROR: Method = Method::Allocate(Kind::Error);
pub const CREATE_PERMISSION_REQUEST: Method = Method::CreatePermission(Kind::Request);
pub const CREATE_PERMISSION_RESPONSE: Method = Method::CreatePermission(Kind::Response);
pub const CREATE_PERMISSION_ERROR: Method = Method::CreatePermission(Kind::Error);
pub const CHANNEL_BIND_REQUEST: Method = Method::ChannelBind(Kind::Request);
pub const CHANNEL_BIND_RESPONSE: Method = Method::ChannelBind(Kind::Response);
pub const CHANNEL_BIND_ERROR: Method = Method::ChannelBind(Kind::Error);
pub const REFRESH_REQUEST: Method = Method::Refresh(Kind::Request);
pub const REFRESH_RESPONSE: Method = Method::Refresh(Kind::Response);
pub const REFRESH_ERROR: Method = Method::Refresh(Kind::Error);
pub const SEND_INDICATION: Method = Method::SendIndication;
pub const DATA_INDICATION: Method = Method::DataIndication;

impl Method {
    pub fn is_error(&self) -> bool {
        matches!(
            self,
            Method::Binding(Kind::Error)
                | Method::Allocate(Kind::Error)
                | Method::Refresh(Kind::Error)
                | Method::CreatePermission(Kind::Error)
                | Method::ChannelBind(Kind::Error)
        )
    }

    pub fn is_response(&self) -> bool {
        matches!(
            self,
            Method::Binding(Kind::Response | Kind::Error)
                | Method::Allocate(Kind::Response | Kind::Error)
                | Method::Refresh(Kind::Response | Kind::Error)
                | Method::CreatePermission(Kind::Response | Kind::Error)
                | Method::ChannelBind(Kind::Response | Kind::Error)
        )
    }
}

impl TryFrom<u16> for Method {
    type Error = Error;

    /// # Test
    ///
    /// ```
    /// use std::convert::TryFrom;
    /// use turn_client_codec::message::methods::*;
    ///
    /// assert_eq!(Method::try_from(0x0003).unwrap(), ALLOCATE_REQUEST);
    /// assert_eq!(Method::try_from(0x0103).unwrap(), ALLOCATE_RESPONSE);
    /// assert_eq!(Method::try_from(0x0113).unwrap(), ALLOCATE_ERROR);
    /// assert_eq!(Method::try_from(0x0016).unwrap(), SEND_INDICATION);
    /// assert_eq!(Method::try_from(0x0017).unwrap(), DATA_INDICATION);
    /// ```
    fn try_from(value: u16) -> Result<Self, Error> {
        Ok(match value {
            0x0001 => Self::Binding(Kind::Request),
            0x0101 => Self::Binding(Kind::Response),
            0x0111 => Self::Binding(Kind::Error),
            0x0003 => Self::Allocate(Kind::Request),
            0x0103 => Self::Allocate(Kind::Response),
            0x0113 => Self::Allocate(Kind::Error),
            0x0004 => Self::Refresh(Kind::Request),
            0x0104 => Self::Refresh(Kind::Response),
            0x0114 => Self::Refresh(Kind::Error),
            0x0008 => Self::CreatePermission(Kind::Request),
            0x0108 => Self::CreatePermission(Kind::Response),
            0x0118 => Self::CreatePermission(Kind::Error),
            0x0009 => Self::ChannelBind(Kind::Request),
            0x0109 => Self::ChannelBind(Kind::Response),
            0x0119 => Self::ChannelBind(Kind::Error),
            0x0016 => Self::SendIndication,
            0x0017 => Self::DataIndication,
            _ => return Err(Error::UnknownMethod),
        })
    }
}

impl From<Method> for u16 {
    /// # Test
    ///
    /// ```
    /// use turn_client_codec::message::methods::*;
    ///
    /// assert_eq!(0x0004u16, u16::from(REFRESH_REQUEST));
    /// assert_eq!(0x0104u16, u16::from(REFRESH_RESPONSE));
    /// assert_eq!(0x0114u16, u16::from(REFRESH_ERROR));
    /// assert_eq!(0x0009u16, u16::from(CHANNEL_BIND_REQUEST));
    /// ```
    fn from(value: Method) -> Self {
        match value {
            Method::Binding(Kind::Request) => 0x0001,
            Method::Binding(Kind::Response) => 0x0101,
            Method::Binding(Kind::Error) => 0x0111,
            Method::Allocate(Kind::Request) => 0x0003,
            Method::Allocate(Kind::Response) => 0x0103,
            Method::Allocate(Kind::Error) => 0x0113,
            Method::Refresh(Kind::Request) => 0x0004,
            Method::Refresh(Kind::Response) => 0x0104,
            Method::Refresh(Kind::Error) => 0x0114,
            Method::CreatePermission(Kind::Request) => 0x0008,
            Method::CreatePermission(Kind::Response) => 0x0108,
            Method::CreatePermission(Kind::Error) => 0x0118,
            Method::ChannelBind(Kind::Request) => 0x0009,
            Method::ChannelBind(Kind::Response) => 0x0109,
            Method::ChannelBind(Kind::Error) => 0x0119,
            Method::SendIndication => 0x0016,
            Method::DataIndication => 0x0017,
        }
    }
}
