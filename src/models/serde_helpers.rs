// Serde helpers for model fields that the API may send as null instead of omitting.

use serde::{Deserialize, Deserializer};

/// Deserializes a field that may be `null` into the type's default value.
///
/// The backend serializes empty property maps and unset flags as `null` on some
/// endpoints and omits them on others; both decode to `T::default()`.
pub fn deserialize_null_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    let value = Option::<T>::deserialize(deserializer)?;
    Ok(value.unwrap_or_default())
}

/// Deserializes an optional string, treating `""` the same as `null`.
pub fn deserialize_empty_as_none<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<String>::deserialize(deserializer)?;
    Ok(value.filter(|s| !s.trim().is_empty()))
}
