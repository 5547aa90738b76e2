use http::Uri;

/// Converts a value into a [`Uri`] with error handling.
///
/// Implemented for [`Uri`], [`String`], and string slices. The resulting
/// URI must be absolute: it needs a scheme of `http` or `https` and a
/// host.
pub trait IntoUri: sealed::IntoUriSealed {}

impl IntoUri for Uri {}
impl IntoUri for &str {}
impl IntoUri for String {}
impl IntoUri for &String {}

mod sealed {
    use http::Uri;

    use crate::error::{BadScheme, Error};
    use crate::Result;

    pub trait IntoUriSealed {
        fn into_uri(self) -> Result<Uri>;
    }

    impl IntoUriSealed for Uri {
        fn into_uri(self) -> Result<Uri> {
            match self.scheme_str() {
                Some("http") | Some("https") => {}
                _ => return Err(Error::new(crate::error::Kind::Builder, Some(BadScheme))
                    .with_uri(self)),
            }
            if self.host().is_none() {
                return Err(Error::builder("URI is missing a host").with_uri(self));
            }
            Ok(self)
        }
    }

    impl IntoUriSealed for &str {
        fn into_uri(self) -> Result<Uri> {
            match self.parse::<Uri>() {
                Ok(uri) => uri.into_uri(),
                Err(err) => Err(Error::builder(err)),
            }
        }
    }

    impl IntoUriSealed for String {
        fn into_uri(self) -> Result<Uri> {
            self.as_str().into_uri()
        }
    }

    impl IntoUriSealed for &String {
        fn into_uri(self) -> Result<Uri> {
            self.as_str().into_uri()
        }
    }
}

pub(crate) use sealed::IntoUriSealed;

#[cfg(test)]
mod tests {
    use super::IntoUriSealed;

    #[test]
    fn accepts_absolute_http() {
        assert!("http://example.com/path".into_uri().is_ok());
        assert!("https://example.com".into_uri().is_ok());
    }

    #[test]
    fn rejects_relative() {
        let err = "/just/a/path".into_uri().unwrap_err();
        assert!(err.is_builder());
    }

    #[test]
    fn rejects_unknown_scheme() {
        let err = "ftp://example.com".into_uri().unwrap_err();
        assert!(err.is_builder());
    }
}
