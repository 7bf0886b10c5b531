/// Declares a `ByteString` newtype whose contents went through `$validate`.
///
/// The generated type can be built from `&'static str`, `&str`, `String` and
/// `ByteString`, and derefs to `str`.
macro_rules! validated_string {
    ($(#[$meta:meta])* $vis:vis struct $name:ident; error = $error:ty; validate = $validate:path;) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
        $vis struct $name(::bytestring::ByteString);

        impl $name {
            #[doc = concat!("Builds a `", stringify!($name), "` from a static string")]
            ///
            /// # Panics
            ///
            /// Panics if `value` doesn't pass validation.
            #[must_use]
            pub fn from_static(value: &'static str) -> Self {
                match Self::try_from(::bytestring::ByteString::from_static(value)) {
                    Ok(this) => this,
                    Err(err) => panic!("invalid {} {value:?}: {err}", stringify!($name)),
                }
            }

            #[doc = concat!("Builds a `", stringify!($name), "` without validating it")]
            ///
            /// Values decoded from the server take this path. Sending an
            /// unchecked value back to the server can corrupt the protocol
            /// stream, so user input should go through the `TryFrom`
            /// implementations instead. Validation still runs in debug builds.
            #[must_use]
            pub fn from_dangerous_value(value: ::bytestring::ByteString) -> Self {
                debug_assert!(
                    $validate(&value).is_ok(),
                    "{} {value:?} is invalid",
                    stringify!($name)
                );
                Self(value)
            }

            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl ::core::fmt::Display for $name {
            fn fmt(&self, f: &mut ::core::fmt::Formatter<'_>) -> ::core::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl TryFrom<::bytestring::ByteString> for $name {
            type Error = $error;

            fn try_from(value: ::bytestring::ByteString) -> Result<Self, Self::Error> {
                $validate(&value)?;
                Ok(Self(value))
            }
        }

        impl TryFrom<::alloc::string::String> for $name {
            type Error = $error;

            fn try_from(value: ::alloc::string::String) -> Result<Self, Self::Error> {
                Self::try_from(::bytestring::ByteString::from(value))
            }
        }

        impl TryFrom<&str> for $name {
            type Error = $error;

            fn try_from(value: &str) -> Result<Self, Self::Error> {
                $validate(value)?;
                Ok(Self(::bytestring::ByteString::from(value)))
            }
        }

        impl From<$name> for ::bytestring::ByteString {
            fn from(value: $name) -> Self {
                value.0
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                self.as_str()
            }
        }

        impl AsRef<[u8]> for $name {
            fn as_ref(&self) -> &[u8] {
                self.as_str().as_bytes()
            }
        }

        impl ::core::ops::Deref for $name {
            type Target = str;

            fn deref(&self) -> &str {
                self.as_str()
            }
        }

        impl ::serde::Serialize for $name {
            fn serialize<S: ::serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(self.as_str())
            }
        }

        impl<'de> ::serde::Deserialize<'de> for $name {
            fn deserialize<D: ::serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let value =
                    <::bytestring::ByteString as ::serde::Deserialize>::deserialize(deserializer)?;
                Self::try_from(value).map_err(::serde::de::Error::custom)
            }
        }
    };
}
