use crate::auth::SteamGuardToken;
use another_steam_totp::generate_auth_code;
use futures_util::future::{select, Either};
use serde::Deserialize;
use std::pin::pin;
use tracing::error;

/// A confirmation steam accepts for a pending login, as returned by the auth api
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AllowedConfirmation {
    confirmation_type: i32,
}

impl AllowedConfirmation {
    pub fn new(guard_type: GuardType) -> Self {
        AllowedConfirmation {
            confirmation_type: guard_type as i32,
        }
    }
}

/// `EAuthSessionGuardType`
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[repr(i32)]
pub enum GuardType {
    Unknown = 0,
    None = 1,
    EmailCode = 2,
    DeviceCode = 3,
    DeviceConfirmation = 4,
    EmailConfirmation = 5,
    MachineToken = 6,
    LegacyMachineAuth = 7,
}

impl From<i32> for GuardType {
    fn from(value: i32) -> Self {
        match value {
            1 => GuardType::None,
            2 => GuardType::EmailCode,
            3 => GuardType::DeviceCode,
            4 => GuardType::DeviceConfirmation,
            5 => GuardType::EmailConfirmation,
            6 => GuardType::MachineToken,
            7 => GuardType::LegacyMachineAuth,
            _ => GuardType::Unknown,
        }
    }
}

/// A method that can be used to confirm a login
#[derive(Debug, Clone)]
pub struct ConfirmationMethod(AllowedConfirmation);

impl From<AllowedConfirmation> for ConfirmationMethod {
    fn from(value: AllowedConfirmation) -> Self {
        Self(value)
    }
}

impl ConfirmationMethod {
    fn guard_type(&self) -> GuardType {
        GuardType::from(self.0.confirmation_type)
    }

    /// Get the human-readable confirmation type
    pub fn confirmation_type(&self) -> &'static str {
        match self.guard_type() {
            GuardType::Unknown => "unknown",
            GuardType::None => "none",
            GuardType::EmailCode => "email",
            GuardType::DeviceCode => "device code",
            GuardType::DeviceConfirmation => "device confirmation",
            GuardType::EmailConfirmation => "email confirmation",
            GuardType::MachineToken => "machine token",
            GuardType::LegacyMachineAuth => "machine auth",
        }
    }

    /// Is any action required to confirm the login
    pub fn action_required(&self) -> bool {
        self.guard_type() != GuardType::None
    }

    /// Get the class of the confirmation
    pub fn class(&self) -> ConfirmationMethodClass {
        match self.guard_type() {
            GuardType::Unknown | GuardType::None => ConfirmationMethodClass::None,
            GuardType::EmailCode | GuardType::DeviceCode => ConfirmationMethodClass::Code,
            GuardType::DeviceConfirmation | GuardType::EmailConfirmation => {
                ConfirmationMethodClass::Confirmation
            }
            GuardType::MachineToken | GuardType::LegacyMachineAuth => {
                ConfirmationMethodClass::Stored
            }
        }
    }

    /// Get the token type required for the confirmation, if the confirmation asks for a code
    pub fn token_type(&self) -> Option<GuardTokenType> {
        match self.guard_type() {
            GuardType::EmailCode => Some(GuardTokenType::Email),
            GuardType::DeviceCode => Some(GuardTokenType::Device),
            _ => None,
        }
    }
}

/// The class of confirmation method
#[derive(Eq, PartialEq, Debug, Clone)]
pub enum ConfirmationMethodClass {
    /// Provide a totp token
    Code,
    /// Confirm the login out-of-band
    Confirmation,
    /// Provide stored guard data
    Stored,
    /// No action required
    None,
}

/// The action to perform to confirm the login
#[non_exhaustive]
#[derive(Debug)]
pub enum ConfirmationAction {
    /// A totp token to send to the server
    GuardToken(SteamGuardToken, GuardTokenType),
    /// No action required
    None,
    /// Login has been canceled
    Abort,
}

/// The type of guard token
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum GuardTokenType {
    Email,
    Device,
}

impl GuardTokenType {
    pub(crate) fn code_type(self) -> i32 {
        match self {
            GuardTokenType::Email => GuardType::EmailCode as i32,
            GuardTokenType::Device => GuardType::DeviceCode as i32,
        }
    }
}

/// A trait for handling login confirmations
///
/// Handlers exist for:
///
/// - A code an operator already supplied with the login request: [`ProvidedCodeConfirmationHandler`].
/// - Generating a code from the pre-shared secret: [`SharedSecretAuthConfirmationHandler`].
/// - Waiting for the user to confirm the login from the mobile app: [`DeviceConfirmationHandler`].
///
/// The session provider adds one that asks the operators through the 2FA relay.
pub trait AuthConfirmationHandler: Sized {
    /// Perform the confirmation action given a list of allowed confirmations for the login
    ///
    /// If the confirmation handler supports any of the allowed confirmations,
    /// it returns a [`ConfirmationAction`] with the required action.
    ///
    /// If the confirmation handler does not support any of the allowed confirmations it returns `None`.
    /// If no confirmation handler supports the allowed confirmations the login will fail.
    fn handle_confirmation(
        self,
        allowed_confirmations: &[ConfirmationMethod],
    ) -> impl std::future::Future<Output = Option<ConfirmationAction>> + Send;

    /// Return a new confirmation handler that combines the current one with a new one.
    ///
    /// The resulting confirmation handler will handle both handler in parallel.
    fn or<Right: AuthConfirmationHandler>(
        self,
        other: Right,
    ) -> EitherConfirmationHandler<Self, Right> {
        EitherConfirmationHandler::new(self, other)
    }
}

/// Use a code that was handed in together with the login request
pub struct ProvidedCodeConfirmationHandler {
    code: String,
}

impl ProvidedCodeConfirmationHandler {
    pub fn new(code: impl Into<String>) -> Self {
        ProvidedCodeConfirmationHandler { code: code.into() }
    }
}

impl AuthConfirmationHandler for ProvidedCodeConfirmationHandler {
    async fn handle_confirmation(
        self,
        allowed_confirmations: &[ConfirmationMethod],
    ) -> Option<ConfirmationAction> {
        let token_type = allowed_confirmations
            .iter()
            .find_map(ConfirmationMethod::token_type)?;
        Some(ConfirmationAction::GuardToken(
            SteamGuardToken::new(self.code),
            token_type,
        ))
    }
}

/// Generate the steam guard totp token from the shared secret
///
/// This requires no operator interaction during login but requires the totp secret to be retrieved in advance
pub struct SharedSecretAuthConfirmationHandler {
    shared_secret: String,
}

impl SharedSecretAuthConfirmationHandler {
    /// The totp shared secret encoded as base64
    ///
    /// Note that the secret as found in `totp://` urls is base32 encoded, not base64
    pub fn new(shared_secret: &str) -> Self {
        SharedSecretAuthConfirmationHandler {
            shared_secret: shared_secret.into(),
        }
    }
}

impl AuthConfirmationHandler for SharedSecretAuthConfirmationHandler {
    async fn handle_confirmation(
        self,
        allowed_confirmations: &[ConfirmationMethod],
    ) -> Option<ConfirmationAction> {
        let token_type = allowed_confirmations
            .iter()
            .filter(|method| method.token_type() == Some(GuardTokenType::Device))
            .find_map(ConfirmationMethod::token_type)?;
        match generate_auth_code(self.shared_secret, None) {
            Ok(auth_code) => Some(ConfirmationAction::GuardToken(
                SteamGuardToken::new(auth_code),
                token_type,
            )),
            Err(e) => {
                error!(error = ?e, "could not generate auth code from shared secret");
                Some(ConfirmationAction::Abort)
            }
        }
    }
}

/// Wait for the user to confirm the login in the mobile app
#[derive(Default)]
pub struct DeviceConfirmationHandler;

impl AuthConfirmationHandler for DeviceConfirmationHandler {
    async fn handle_confirmation(
        self,
        allowed_confirmations: &[ConfirmationMethod],
    ) -> Option<ConfirmationAction> {
        for method in allowed_confirmations {
            if method.class() == ConfirmationMethodClass::Confirmation {
                return Some(ConfirmationAction::None);
            }
        }
        None
    }
}

/// Use multiple confirmation handlers in parallel.
///
/// This lets the operators pick between providing a totp code or confirming
/// the login in the mobile app.
pub struct EitherConfirmationHandler<Left, Right> {
    left: Left,
    right: Right,
}

impl<Left, Right> EitherConfirmationHandler<Left, Right> {
    pub fn new(left: Left, right: Right) -> Self {
        Self { left, right }
    }
}

impl<Left, Right> AuthConfirmationHandler for EitherConfirmationHandler<Left, Right>
where
    Left: AuthConfirmationHandler + Send + Sync,
    Right: AuthConfirmationHandler + Send + Sync,
{
    async fn handle_confirmation(
        self,
        allowed_confirmations: &[ConfirmationMethod],
    ) -> Option<ConfirmationAction> {
        match select(
            pin!(self.left.handle_confirmation(allowed_confirmations)),
            pin!(self.right.handle_confirmation(allowed_confirmations)),
        )
        .await
        {
            Either::Left((left_result, right_fut)) => match left_result {
                None | Some(ConfirmationAction::None) => right_fut.await,
                _ => left_result,
            },
            Either::Right((right_result, left_fut)) => match right_result {
                None | Some(ConfirmationAction::None) => left_fut.await,
                _ => right_result,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn methods(types: &[GuardType]) -> Vec<ConfirmationMethod> {
        types
            .iter()
            .map(|ty| ConfirmationMethod::from(AllowedConfirmation::new(*ty)))
            .collect()
    }

    #[test]
    fn classify_methods() {
        let all = methods(&[
            GuardType::None,
            GuardType::EmailCode,
            GuardType::DeviceCode,
            GuardType::DeviceConfirmation,
            GuardType::MachineToken,
        ]);
        assert!(!all[0].action_required());
        assert_eq!(all[1].token_type(), Some(GuardTokenType::Email));
        assert_eq!(all[2].token_type(), Some(GuardTokenType::Device));
        assert_eq!(all[3].class(), ConfirmationMethodClass::Confirmation);
        assert_eq!(all[4].class(), ConfirmationMethodClass::Stored);
        let unknown = ConfirmationMethod::from(AllowedConfirmation::default());
        assert_eq!(unknown.confirmation_type(), "unknown");
    }

    #[tokio::test]
    async fn provided_code_uses_first_code_method() {
        let allowed = methods(&[GuardType::DeviceConfirmation, GuardType::EmailCode]);
        let action = ProvidedCodeConfirmationHandler::new("AB12C")
            .handle_confirmation(&allowed)
            .await;
        match action {
            Some(ConfirmationAction::GuardToken(token, ty)) => {
                assert_eq!(token.0, "AB12C");
                assert_eq!(ty, GuardTokenType::Email);
            }
            other => panic!("unexpected action {other:?}"),
        }
    }

    #[tokio::test]
    async fn provided_code_without_code_method() {
        let allowed = methods(&[GuardType::DeviceConfirmation]);
        assert!(ProvidedCodeConfirmationHandler::new("AB12C")
            .handle_confirmation(&allowed)
            .await
            .is_none());
    }

    #[tokio::test]
    async fn shared_secret_only_answers_device_codes() {
        let secret = "zvIayp3JPvtvX/QGHqsqKBk/44s=";
        let email_only = methods(&[GuardType::EmailCode]);
        assert!(SharedSecretAuthConfirmationHandler::new(secret)
            .handle_confirmation(&email_only)
            .await
            .is_none());

        let device = methods(&[GuardType::DeviceCode]);
        match SharedSecretAuthConfirmationHandler::new(secret)
            .handle_confirmation(&device)
            .await
        {
            Some(ConfirmationAction::GuardToken(token, GuardTokenType::Device)) => {
                assert_eq!(token.0.len(), 5);
            }
            other => panic!("unexpected action {other:?}"),
        }
    }

    #[tokio::test]
    async fn either_prefers_a_real_action() {
        let allowed = methods(&[GuardType::DeviceCode, GuardType::DeviceConfirmation]);
        let action = DeviceConfirmationHandler
            .or(ProvidedCodeConfirmationHandler::new("QQQQQ"))
            .handle_confirmation(&allowed)
            .await;
        assert!(matches!(
            action,
            Some(ConfirmationAction::GuardToken(_, GuardTokenType::Device))
        ));
    }
}
