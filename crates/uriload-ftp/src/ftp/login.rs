//! Login sequence: welcome → USER → PASS → FEAT (→ TYPE).
//!
//! The machine only decides what happens next; the blocking and async
//! sessions perform the I/O and feed every reply back through
//! [`LoginMachine::on_reply`].

use crate::ftp::error::{FtpError, FtpResult};
use crate::ftp::protocol::Command;
use crate::ftp::reply::{check, Reply};
use crate::ftp::types::{FeatureSet, TransferType};

/// What the driver must do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginStep {
    /// Read a reply without sending anything (the welcome banner).
    ReadReply,
    /// Send this command, then read its reply.
    Send(Command),
    /// Login finished; the session is usable.
    Done(FeatureSet),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginState {
    Unauthenticated,
    AwaitingUser,
    AwaitingPass,
    Authenticated,
    SettingType,
    FeaturesKnown,
}

#[derive(Debug)]
pub struct LoginMachine {
    state: LoginState,
    user: String,
    password: String,
    transfer_type: Option<TransferType>,
    features: FeatureSet,
}

impl LoginMachine {
    pub fn new(
        user: impl Into<String>,
        password: impl Into<String>,
        transfer_type: Option<TransferType>,
    ) -> Self {
        Self {
            state: LoginState::Unauthenticated,
            user: user.into(),
            password: password.into(),
            transfer_type,
            features: FeatureSet::empty(),
        }
    }

    pub fn state(&self) -> LoginState {
        self.state
    }

    /// First step after the control connection is established.
    pub fn start(&self) -> LoginStep {
        LoginStep::ReadReply
    }

    /// Advance on the reply to the previous step.
    pub fn on_reply(&mut self, reply: &Reply) -> FtpResult<LoginStep> {
        match self.state {
            LoginState::Unauthenticated => match reply.code {
                220 => {
                    self.state = LoginState::AwaitingUser;
                    Ok(LoginStep::Send(Command::User(self.user.clone())))
                }
                120 => Err(FtpError::ServiceUnavailable {
                    code: reply.code,
                    message: reply.message.clone(),
                }),
                code => Err(FtpError::unexpected(code, reply.message.clone())),
            },
            LoginState::AwaitingUser => match reply.code {
                230 => self.authenticated(),
                331 => {
                    self.state = LoginState::AwaitingPass;
                    Ok(LoginStep::Send(Command::Pass(self.password.clone())))
                }
                332 => Err(FtpError::not_supported("account (ACCT) login")),
                _ => check(reply, &[230, 331]).map(|_| LoginStep::ReadReply),
            },
            LoginState::AwaitingPass => match reply.code {
                230 | 202 => self.authenticated(),
                332 => Err(FtpError::not_supported("account (ACCT) login")),
                _ => check(reply, &[230, 202]).map(|_| LoginStep::ReadReply),
            },
            LoginState::Authenticated => {
                if reply.code == 211 {
                    self.features = FeatureSet::from_feat_message(&reply.message);
                } else {
                    log::debug!("FEAT refused ({}), continuing without features", reply.code);
                }
                match self.transfer_type {
                    Some(tt) => {
                        self.state = LoginState::SettingType;
                        Ok(LoginStep::Send(Command::Type(tt)))
                    }
                    None => Ok(self.finish()),
                }
            }
            LoginState::SettingType => {
                check(reply, &[200])?;
                Ok(self.finish())
            }
            LoginState::FeaturesKnown => Err(FtpError::unexpected(reply.code, reply.message.clone())),
        }
    }

    fn authenticated(&mut self) -> FtpResult<LoginStep> {
        self.state = LoginState::Authenticated;
        Ok(LoginStep::Send(Command::Feat))
    }

    fn finish(&mut self) -> LoginStep {
        self.state = LoginState::FeaturesKnown;
        LoginStep::Done(self.features)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ftp::reply::parse_reply;

    fn machine() -> LoginMachine {
        LoginMachine::new("anon", "pw", None)
    }

    fn reply(code: u16, msg: &str) -> Reply {
        Reply::new(code, msg)
    }

    #[test]
    fn full_sequence_with_features() {
        let mut m = machine();
        assert_eq!(m.start(), LoginStep::ReadReply);
        assert_eq!(
            m.on_reply(&reply(220, "hi")).unwrap(),
            LoginStep::Send(Command::User("anon".into()))
        );
        assert_eq!(
            m.on_reply(&reply(331, "pw please")).unwrap(),
            LoginStep::Send(Command::Pass("pw".into()))
        );
        assert_eq!(m.on_reply(&reply(230, "ok")).unwrap(), LoginStep::Send(Command::Feat));
        let feat = parse_reply("211-Features:\r\n MDTM\r\n SIZE\r\n UTF8\r\n211 End\r\n").unwrap();
        assert_eq!(
            m.on_reply(&feat).unwrap(),
            LoginStep::Done(FeatureSet::MDTM | FeatureSet::SIZE | FeatureSet::UTF8)
        );
        assert_eq!(m.state(), LoginState::FeaturesKnown);
    }

    #[test]
    fn user_230_skips_pass() {
        let mut m = machine();
        m.on_reply(&reply(220, "hi")).unwrap();
        assert_eq!(m.on_reply(&reply(230, "welcome")).unwrap(), LoginStep::Send(Command::Feat));
    }

    #[test]
    fn pass_202_is_authenticated() {
        let mut m = machine();
        m.on_reply(&reply(220, "hi")).unwrap();
        m.on_reply(&reply(331, "pw")).unwrap();
        assert_eq!(m.on_reply(&reply(202, "superfluous")).unwrap(), LoginStep::Send(Command::Feat));
    }

    #[test]
    fn welcome_120_is_service_unavailable() {
        let err = machine().on_reply(&reply(120, "ready in 5 min")).unwrap_err();
        assert!(matches!(err, FtpError::ServiceUnavailable { code: 120, .. }));
        assert!(err.is_retryable());
    }

    #[test]
    fn welcome_other_is_unexpected() {
        let err = machine().on_reply(&reply(200, "eh")).unwrap_err();
        assert!(matches!(err, FtpError::UnexpectedReply { code: 200, .. }));
    }

    #[test]
    fn account_step_not_supported() {
        let mut m = machine();
        m.on_reply(&reply(220, "hi")).unwrap();
        assert!(matches!(m.on_reply(&reply(332, "acct")), Err(FtpError::NotSupported(_))));

        let mut m = machine();
        m.on_reply(&reply(220, "hi")).unwrap();
        m.on_reply(&reply(331, "pw")).unwrap();
        assert!(matches!(m.on_reply(&reply(332, "acct")), Err(FtpError::NotSupported(_))));
    }

    #[test]
    fn bad_password_is_permanent_auth() {
        let mut m = machine();
        m.on_reply(&reply(220, "hi")).unwrap();
        m.on_reply(&reply(331, "pw")).unwrap();
        let err = m.on_reply(&reply(530, "Login incorrect")).unwrap_err();
        assert!(matches!(err, FtpError::PermanentNegative { code: 530, .. }));
    }

    #[test]
    fn feat_refusal_degrades_to_empty() {
        let mut m = machine();
        m.on_reply(&reply(220, "hi")).unwrap();
        m.on_reply(&reply(230, "ok")).unwrap();
        assert_eq!(
            m.on_reply(&reply(502, "not implemented")).unwrap(),
            LoginStep::Done(FeatureSet::empty())
        );
    }

    #[test]
    fn transfer_type_sent_after_feat() {
        let mut m = LoginMachine::new("anon", "pw", Some(TransferType::Binary));
        m.on_reply(&reply(220, "hi")).unwrap();
        m.on_reply(&reply(230, "ok")).unwrap();
        assert_eq!(
            m.on_reply(&reply(500, "FEAT?")).unwrap(),
            LoginStep::Send(Command::Type(TransferType::Binary))
        );
        assert_eq!(m.on_reply(&reply(200, "Type set to I")).unwrap(), LoginStep::Done(FeatureSet::empty()));
    }
}
