use tower_cookies::cookie::{SameSite, time::Duration};
use tower_cookies::{Cookie, Cookies};
use crate::config::Config;

/// Name of the cookie carrying the opaque refresh token.
pub const REFRESH_COOKIE: &str = "refresh_token";

/// How the refresh token cookie is written.
#[derive(Clone, Debug)]
pub struct CookiePolicy {
    pub secure: bool,
    pub same_site: SameSite,
    pub domain: Option<String>,
    /// Matches the refresh token lifetime.
    pub max_age: Duration,
}

impl CookiePolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            secure: config.cookie_secure,
            same_site: config.cookie_same_site,
            domain: config.cookie_domain.clone(),
            max_age: Duration::days(config.refresh_token_ttl_days),
        }
    }

    fn build(&self, value: String, max_age: Duration) -> Cookie<'static> {
        let mut cookie = Cookie::new(REFRESH_COOKIE, value);
        cookie.set_http_only(true);
        cookie.set_secure(self.secure);
        cookie.set_same_site(self.same_site);
        cookie.set_path("/");
        cookie.set_max_age(max_age);
        if let Some(domain) = &self.domain {
            cookie.set_domain(domain.clone());
        }
        cookie
    }

    /// Writes `token` as the refresh cookie.
    pub fn write(&self, cookies: &Cookies, token: String) {
        cookies.add(self.build(token, self.max_age));
    }

    /// Expires the refresh cookie on the client.
    pub fn clear(&self, cookies: &Cookies) {
        cookies.add(self.build(String::new(), Duration::ZERO));
    }

    /// Reads the presented refresh token, if any.
    pub fn read(cookies: &Cookies) -> Option<String> {
        cookies
            .get(REFRESH_COOKIE)
            .map(|c| c.value().to_string())
            .filter(|v| !v.is_empty())
    }
}
