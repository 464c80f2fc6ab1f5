use std::collections::BTreeMap;

use hyper::Method;

/// Parameters captured from `:name` segments of a matched pattern.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PathParams(BTreeMap<String, String>);

impl PathParams {
    pub fn from_pairs<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self(
            pairs
                .into_iter()
                .map(|(name, value)| (name.into(), value.into()))
                .collect(),
        )
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Param(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathPattern {
    template: String,
    segments: Vec<Segment>,
}

impl PathPattern {
    pub fn parse(template: &str) -> Self {
        let segments = split_path(template)
            .map(|segment| match segment.strip_prefix(':') {
                Some(name) => Segment::Param(name.to_owned()),
                None => Segment::Literal(segment.to_owned()),
            })
            .collect();
        Self {
            template: template.to_owned(),
            segments,
        }
    }

    pub fn template(&self) -> &str {
        &self.template
    }

    pub fn matches(&self, path: &str) -> Option<PathParams> {
        let mut params = BTreeMap::new();
        let mut parts = split_path(path);
        for segment in &self.segments {
            let part = parts.next()?;
            match segment {
                Segment::Literal(literal) if literal == part => {}
                Segment::Literal(_) => return None,
                Segment::Param(name) => {
                    params.insert(name.clone(), part.to_owned());
                }
            }
        }
        if parts.next().is_some() {
            return None;
        }
        Some(PathParams(params))
    }
}

fn split_path(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|segment| !segment.is_empty())
}

#[derive(Debug)]
pub struct Route<H> {
    pub method: Method,
    pub pattern: PathPattern,
    pub handler: H,
}

/// Routes in registration order; the first match wins.
#[derive(Debug)]
pub struct RouteTable<H> {
    routes: Vec<Route<H>>,
}

impl<H> Default for RouteTable<H> {
    fn default() -> Self {
        Self { routes: Vec::new() }
    }
}

impl<H> RouteTable<H> {
    pub fn add(&mut self, method: Method, template: &str, handler: H) -> &mut Self {
        self.routes.push(Route {
            method,
            pattern: PathPattern::parse(template),
            handler,
        });
        self
    }

    pub fn find(&self, method: &Method, path: &str) -> Option<(&Route<H>, PathParams)> {
        self.routes
            .iter()
            .filter(|route| route.method == method)
            .find_map(|route| route.pattern.matches(path).map(|params| (route, params)))
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use hyper::Method;

    use super::{PathParams, PathPattern, RouteTable};

    #[test]
    fn params_are_extracted_from_matching_paths() {
        let pattern = PathPattern::parse("/users/:id");

        assert_eq!(
            pattern.matches("/users/42/"),
            Some(PathParams::from_pairs([("id", "42")]))
        );
        assert_eq!(pattern.matches("/users"), None);
        assert_eq!(pattern.matches("/users/42/posts"), None);
        assert_eq!(pattern.matches("/nudges/42"), None);
    }

    #[test]
    fn first_registered_route_wins() {
        let mut table = RouteTable::default();
        table
            .add(Method::GET, "/_mock/network", "literal")
            .add(Method::GET, "/_mock/:section", "param")
            .add(Method::DELETE, "/_mock/network", "delete");

        let (route, params) = table.find(&Method::GET, "/_mock/network").unwrap();
        assert_eq!(route.handler, "literal");
        assert_eq!(params, PathParams::default());

        let (route, params) = table.find(&Method::GET, "/_mock/backup").unwrap();
        assert_eq!(route.handler, "param");
        assert_eq!(params.get("section"), Some("backup"));

        assert!(table.find(&Method::POST, "/_mock/network").is_none());
        assert_eq!(table.len(), 3);
    }
}
