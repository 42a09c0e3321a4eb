use justconfig::error::ConfigError;
use justconfig::item::{MapAction, StringItem};

/// Strips one pair of surrounding double quotes from configuration strings.
pub trait Unquote
where
    Self: Sized,
{
    fn unquote(self) -> Result<StringItem, ConfigError>;
}

impl Unquote for Result<StringItem, ConfigError> {
    /// Values are trimmed first; unquoted values are kept as they are.
    fn unquote(self) -> Result<StringItem, ConfigError> {
        self?.map(|raw| {
            let trimmed = raw.trim();
            match trimmed.strip_prefix('"').and_then(|rest| rest.strip_suffix('"')) {
                Some(inner) => MapAction::Replace(vec![inner.to_owned()]),
                None if trimmed.len() != raw.len() => MapAction::Replace(vec![trimmed.to_owned()]),
                None => MapAction::Keep,
            }
        })
    }
}
