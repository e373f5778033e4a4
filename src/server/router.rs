//! Ordered route table.

use crate::{
    server::handler::{DynHandler, Handler, NotFound},
    websocket::room::Room,
};
use regex::Regex;
use std::{any::Any, collections::HashMap, fmt, sync::Arc};

pub(crate) type Factory = Arc<dyn Fn() -> Box<dyn DynHandler> + Send + Sync>;

/// Static data attached to a route (or to the whole router) and handed to
/// every handler instance built for it.
///
/// ```
/// use wicket::UserData;
///
/// let data = UserData::new().with("root", String::from("./public"));
/// assert_eq!(data.get::<String>("root").map(String::as_str), Some("./public"));
/// assert_eq!(data.get::<u32>("root"), None);
/// ```
#[derive(Clone, Default)]
pub struct UserData {
    values: HashMap<String, Arc<dyn Any + Send + Sync>>,
    room: Option<Arc<Room>>,
}

impl UserData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with<T: Any + Send + Sync>(mut self, key: &str, value: T) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert<T: Any + Send + Sync>(&mut self, key: &str, value: T) {
        self.values.insert(key.to_owned(), Arc::new(value));
    }

    /// Value under `key` when it has type `T`.
    pub fn get<T: Any>(&self, key: &str) -> Option<&T> {
        self.values.get(key)?.downcast_ref::<T>()
    }

    /// Attaches the WebSocket room served on this route.
    pub fn with_room(mut self, room: Arc<Room>) -> Self {
        self.room = Some(room);
        self
    }

    #[inline]
    pub fn room(&self) -> Option<&Arc<Room>> {
        self.room.as_ref()
    }

    // Globals win over same-named route entries.
    fn merge(&mut self, globals: &UserData) {
        for (key, value) in &globals.values {
            self.values.insert(key.clone(), value.clone());
        }
        if globals.room.is_some() {
            self.room = globals.room.clone();
        }
    }
}

impl fmt::Debug for UserData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserData")
            .field("keys", &self.values.keys().collect::<Vec<_>>())
            .field("room", &self.room.as_ref().map(|room| room.name()))
            .finish()
    }
}

struct Route {
    pattern: Regex,
    factory: Factory,
    user_data: UserData,
}

/// Result of [`Router::resolve`].
pub struct Resolved {
    pub(crate) factory: Factory,
    pub(crate) user_data: UserData,
    pub(crate) captures: Vec<Option<String>>,
}

impl Resolved {
    pub fn user_data(&self) -> &UserData {
        &self.user_data
    }

    /// Positional groups of the matched pattern; unmatched and empty groups are `None`.
    pub fn captures(&self) -> &[Option<String>] {
        &self.captures
    }
}

/// Routes are regular expressions matched against the whole decoded path,
/// tried in registration order; the first match wins.
///
/// ```
/// use wicket::{Handler, Router};
///
/// struct Any;
/// impl Handler for Any {}
///
/// let router = Router::new()
///     .route("/a/(.*)", || Any).unwrap()
///     .route("/a/b", || Any).unwrap();
///
/// assert_eq!(router.resolve("/a/b").captures(), [Some("b".to_owned())]);
/// ```
pub struct Router {
    routes: Vec<Route>,
    globals: UserData,
    not_found: Factory,
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

impl Router {
    pub fn new() -> Self {
        Self {
            routes: Vec::new(),
            globals: UserData::new(),
            not_found: Arc::new(|| -> Box<dyn DynHandler> { Box::new(NotFound) }),
        }
    }

    /// Adds a route; `factory` builds one handler per request.
    pub fn route<H, F>(self, pattern: &str, factory: F) -> Result<Self, regex::Error>
    where
        H: Handler,
        F: Fn() -> H + Send + Sync + 'static,
    {
        self.route_with(pattern, factory, UserData::new())
    }

    /// Adds a route carrying static user data.
    pub fn route_with<H, F>(mut self, pattern: &str, factory: F, user_data: UserData) -> Result<Self, regex::Error>
    where
        H: Handler,
        F: Fn() -> H + Send + Sync + 'static,
    {
        self.routes.push(Route {
            pattern: Regex::new(&format!("^(?:{pattern})$"))?,
            factory: Arc::new(move || -> Box<dyn DynHandler> { Box::new(factory()) }),
            user_data,
        });
        Ok(self)
    }

    /// Value merged into the user data of every route.
    pub fn global<T: Any + Send + Sync>(mut self, key: &str, value: T) -> Self {
        self.globals.insert(key, value);
        self
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// First route fully matching `path`, or the not-found handler with no
    /// captures.
    pub fn resolve(&self, path: &str) -> Resolved {
        for route in &self.routes {
            let Some(found) = route.pattern.captures(path) else {
                continue;
            };

            let mut user_data = route.user_data.clone();
            user_data.merge(&self.globals);

            return Resolved {
                factory: route.factory.clone(),
                user_data,
                captures: found
                    .iter()
                    .skip(1)
                    .map(|group| group.map(|m| m.as_str()).filter(|text| !text.is_empty()).map(str::to_owned))
                    .collect(),
            };
        }

        let mut user_data = UserData::new();
        user_data.merge(&self.globals);

        Resolved {
            factory: self.not_found.clone(),
            user_data,
            captures: Vec::new(),
        }
    }
}

impl fmt::Debug for Router {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Router")
            .field("routes", &self.routes.iter().map(|r| r.pattern.as_str()).collect::<Vec<_>>())
            .field("globals", &self.globals)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::handler::Handler;

    struct Plain;
    impl Handler for Plain {}

    fn router() -> Router {
        Router::new()
            .route("/a/(.*)", || Plain)
            .unwrap()
            .route("/a/b", || Plain)
            .unwrap()
            .route_with(
                "/static/(.+)",
                || Plain,
                UserData::new().with("root", "./public").with("mode", 1u8),
            )
            .unwrap()
            .route("/opt(/x)?(/y)?", || Plain)
            .unwrap()
            .global("mode", 2u8)
    }

    #[test]
    fn first_match_wins() {
        let resolved = router().resolve("/a/b");
        assert_eq!(resolved.captures(), [Some("b".to_owned())]);
    }

    #[test]
    fn full_match_only() {
        let cases = [
            ("/a/zzz", Some(vec![Some("zzz")])),
            ("/a/", Some(vec![None])),
            ("/x/a/b", None),
            ("/static/css/site.css", Some(vec![Some("css/site.css")])),
            ("/static/", None),
            ("/opt/y", Some(vec![None, Some("/y")])),
            ("/opt", Some(vec![None, None])),
        ];

        let router = router();
        for (path, expected) in cases {
            let resolved = router.resolve(path);
            let captures: Vec<Option<&str>> = resolved.captures().iter().map(Option::as_deref).collect();

            match expected {
                Some(expected) => assert_eq!(captures, expected, "{path}"),
                None => {
                    assert!(captures.is_empty(), "{path}");
                    assert!(Arc::ptr_eq(&resolved.factory, &router.not_found), "{path}");
                }
            }
        }
    }

    #[test]
    fn globals_override_route_data() {
        let resolved = router().resolve("/static/app.js");

        assert_eq!(resolved.user_data().get::<&str>("root"), Some(&"./public"));
        assert_eq!(resolved.user_data().get::<u8>("mode"), Some(&2));
        assert_eq!(router().resolve("/nowhere").user_data().get::<u8>("mode"), Some(&2));
    }

    #[test]
    fn bad_pattern() {
        assert!(Router::new().route("/(unclosed", || Plain).is_err());
    }
}
