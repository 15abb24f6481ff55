//! Host parsing, route naming and Ingress inspection helpers.

use std::collections::{BTreeMap, HashMap};

use adler32::RollingAdler32;
use k8s_openapi::api::networking::v1::Ingress;
use kube::ResourceExt;

use crate::crd::{Domain, DomainSpec};
use crate::error::Error;
use crate::kong::{Api, ApiList};

/// Annotation picking a specific "class" for the Ingress. The controller only
/// processes Ingresses with this annotation either unset, empty, or set to
/// [`KONG_INGRESS_CLASS`].
pub const INGRESS_CLASS_KEY: &str = "kubernetes.io/ingress.class";

/// The ingress class handled by this controller
pub const KONG_INGRESS_CLASS: &str = "kong";

/// Annotation naming the namespace that delegates the primary domain
pub const PARENT_ANNOTATION: &str = "kolihub.io/parent";

/// Annotation marking an Ingress that could not recover from a bad state
pub const DIRTY_ANNOTATION: &str = "kolihub.io/dirty";

/// Prefix of the per-host annotations, `kolihub.io/<host> = "primary"`
const HOST_ANNOTATION_PREFIX: &str = "kolihub.io/";

/// Quota of rules per Ingress
const MAX_RULES: usize = 5;

/// Quota of paths per Ingress rule
const MAX_PATHS_PER_RULE: usize = 5;

/// Adler-32 checksum of `data` rendered as lowercase hex. Stable across
/// runs; used only in route names, never for security.
pub fn adler32_hex(data: &str) -> String {
    format!("{:x}", RollingAdler32::from_buffer(data.as_bytes()).hash())
}

/// Deterministic name of the Kong api backing one (host, path) pair of an
/// Ingress. The `~` separators let the garbage collector recover the owning
/// hostname and namespace from the name alone.
pub fn api_name(host: &str, namespace: &str, path: &str) -> String {
    format!("{host}~{namespace}~{}", adler32_hex(path))
}

/// Decompose a hostname into `(primary, sub)`. A host with at least three
/// dot-labels yields its leftmost label as the sub domain; anything shorter
/// is a primary on its own.
pub fn parse_host(host: &str) -> (String, String) {
    let labels: Vec<&str> = host.split('.').collect();
    if labels.len() >= 3 {
        (labels[1..].join("."), labels[0].to_string())
    } else {
        (host.to_string(), String::new())
    }
}

/// A hostname is admissible for an Ingress in `namespace` when its first
/// dot-label splits on `-` into at least three parts whose last three,
/// joined by `-`, spell the namespace.
pub fn host_matches_namespace(host: &str, namespace: &str) -> bool {
    let first_label = host.split('.').next().unwrap_or_default();
    let parts: Vec<&str> = first_label.split('-').collect();
    parts.len() >= 3 && parts[parts.len() - 3..].join("-") == namespace
}

/// Returns the value of the ingress.class annotation, empty when unset
fn ingress_class(ing: &Ingress) -> &str {
    ing.annotations()
        .get(INGRESS_CLASS_KEY)
        .map(String::as_str)
        .unwrap_or("")
}

/// Returns true if the given Ingress either doesn't specify the
/// ingress.class annotation, or it's set to "kong".
pub fn is_kong_ingress(ing: &Ingress) -> bool {
    let class = ingress_class(ing);
    class.is_empty() || class == KONG_INGRESS_CLASS
}

/// Returns true if the Ingress already carries the dirty annotation
pub fn is_dirty(ing: &Ingress) -> bool {
    ing.annotations().get(DIRTY_ANNOTATION).map(String::as_str) == Some("true")
}

/// Derive the set of Domains implied by the hosts of an Ingress.
///
/// Each rule host becomes a Domain named after the host with dots replaced
/// by dashes. A per-host annotation `kolihub.io/<host> = "primary"` claims
/// the whole host as a primary domain; otherwise the host splits into
/// `(primary, sub)` and the `kolihub.io/parent` annotation, when present,
/// names the delegating namespace. Primary domains sort before shared ones
/// so parents are claimed first.
pub fn hosts_from_ingress(ing: &Ingress) -> Vec<Domain> {
    let namespace = ing.namespace().unwrap_or_default();
    let empty = BTreeMap::new();
    let annotations = ing.metadata.annotations.as_ref().unwrap_or(&empty);
    let parent = annotations
        .get(PARENT_ANNOTATION)
        .cloned()
        .unwrap_or_default();

    let rules = ing
        .spec
        .as_ref()
        .and_then(|s| s.rules.as_ref())
        .cloned()
        .unwrap_or_default();

    let mut domains = Vec::new();
    for rule in rules {
        let Some(host) = rule.host.filter(|h| !h.is_empty()) else {
            continue;
        };
        let host_annotation = format!("{HOST_ANNOTATION_PREFIX}{host}");
        let spec = if annotations.get(&host_annotation).map(String::as_str) == Some("primary") {
            DomainSpec {
                primary: host.clone(),
                ..Default::default()
            }
        } else {
            let (primary, sub) = parse_host(&host);
            DomainSpec {
                primary,
                sub,
                parent: parent.clone(),
                ..Default::default()
            }
        };
        let mut domain = Domain::new(&host.replace('.', "-"), spec);
        domain.metadata.namespace = Some(namespace.clone());
        domains.push(domain);
    }
    domains.sort_by_key(|d| !d.is_primary());
    domains
}

/// Enforce the input invariants on an Ingress: rule and path quotas, one
/// backend Service per rule, unique hosts, and hosts that belong to the
/// Ingress namespace. Violations are terminal validation errors.
pub fn validate_ingress(ing: &Ingress) -> Result<(), Error> {
    let namespace = ing.namespace().unwrap_or_default();
    let rules = ing
        .spec
        .as_ref()
        .and_then(|s| s.rules.as_ref())
        .cloned()
        .unwrap_or_default();

    if rules.len() > MAX_RULES {
        return Err(Error::validation(format!(
            "ingress has {} rules, the quota is {MAX_RULES}",
            rules.len()
        )));
    }

    let mut seen_hosts = Vec::new();
    for rule in &rules {
        let host = rule.host.clone().unwrap_or_default();
        if host.is_empty() {
            return Err(Error::validation("ingress rule is missing a host"));
        }
        if seen_hosts.contains(&host) {
            return Err(Error::validation(format!(
                "host '{host}' is declared more than once"
            )));
        }
        if !host_matches_namespace(&host, &namespace) {
            return Err(Error::validation(format!(
                "host '{host}' doesn't belong to namespace '{namespace}'"
            )));
        }
        seen_hosts.push(host.clone());

        let Some(http) = rule.http.as_ref() else {
            continue;
        };
        if http.paths.len() > MAX_PATHS_PER_RULE {
            return Err(Error::validation(format!(
                "host '{host}' has {} paths, the quota is {MAX_PATHS_PER_RULE}",
                http.paths.len()
            )));
        }
        let mut backend_service: Option<String> = None;
        for path in &http.paths {
            let Some(service) = path.backend.service.as_ref() else {
                return Err(Error::validation(format!(
                    "host '{host}' has a path without a service backend"
                )));
            };
            match &backend_service {
                None => backend_service = Some(service.name.clone()),
                Some(current) if *current != service.name => {
                    return Err(Error::validation(format!(
                        "host '{host}' mixes backends '{current}' and '{}', \
                         paths of a rule must share one service",
                        service.name
                    )));
                }
                _ => {}
            }
        }
    }
    Ok(())
}

/// The address Kong forwards matched requests to. The scheme is `https`
/// exactly for port 443.
pub fn upstream_url(cluster_dns: &str, namespace: &str, service: &str, port: i32) -> String {
    let proto = if port == 443 { "https" } else { "http" };
    format!("{proto}://{service}.{namespace}.{cluster_dns}:{port}")
}

/// Backend port number of an Ingress path, when declared numerically
pub fn backend_port(path: &k8s_openapi::api::networking::v1::HTTPIngressPath) -> Option<i32> {
    path.backend
        .service
        .as_ref()
        .and_then(|s| s.port.as_ref())
        .and_then(|p| p.number)
}

/// Group Kong apis by the hostname encoded in their name (the leftmost `~`
/// segment). Names without exactly three segments are not ours and are
/// skipped.
pub fn apis_by_host(list: &ApiList) -> HashMap<String, Vec<Api>> {
    let mut by_host: HashMap<String, Vec<Api>> = HashMap::new();
    for api in &list.data {
        let Some(name) = api.name.as_deref() else {
            continue;
        };
        let segments: Vec<&str> = name.split('~').collect();
        if segments.len() != 3 {
            continue;
        }
        by_host
            .entry(segments[0].to_string())
            .or_default()
            .push(api.clone());
    }
    by_host
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use k8s_openapi::api::networking::v1::{
        HTTPIngressPath, HTTPIngressRuleValue, IngressBackend, IngressRule, IngressServiceBackend,
        IngressSpec, ServiceBackendPort,
    };
    use kube::api::ObjectMeta;
    use rstest::rstest;

    pub(crate) fn ingress_path(path: &str, service: &str, port: i32) -> HTTPIngressPath {
        HTTPIngressPath {
            path: if path.is_empty() {
                None
            } else {
                Some(path.to_string())
            },
            path_type: "ImplementationSpecific".to_string(),
            backend: IngressBackend {
                service: Some(IngressServiceBackend {
                    name: service.to_string(),
                    port: Some(ServiceBackendPort {
                        number: Some(port),
                        name: None,
                    }),
                }),
                resource: None,
            },
        }
    }

    pub(crate) fn ingress_rule(host: &str, paths: Vec<HTTPIngressPath>) -> IngressRule {
        IngressRule {
            host: Some(host.to_string()),
            http: Some(HTTPIngressRuleValue { paths }),
        }
    }

    pub(crate) fn ingress(
        namespace: &str,
        name: &str,
        annotations: &[(&str, &str)],
        rules: Vec<IngressRule>,
    ) -> Ingress {
        Ingress {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                annotations: Some(
                    annotations
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect(),
                ),
                ..Default::default()
            },
            spec: Some(IngressSpec {
                rules: Some(rules),
                ..Default::default()
            }),
            status: None,
        }
    }

    #[rstest]
    #[case("/", "300030")]
    #[case("/api", "32c016a")]
    fn adler_hashes_are_stable(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(adler32_hex(input), expected);
        // determinism across calls
        assert_eq!(adler32_hex(input), adler32_hex(input));
    }

    #[test]
    fn api_names_encode_host_namespace_and_path() {
        assert_eq!(
            api_name("app-team-acme-org.example.io", "team-acme-org", "/"),
            "app-team-acme-org.example.io~team-acme-org~300030"
        );
        assert_eq!(
            api_name("app-team-acme-org.example.io", "team-acme-org", "/api"),
            "app-team-acme-org.example.io~team-acme-org~32c016a"
        );
    }

    #[rstest]
    #[case("app-team-acme-org.example.io", "example.io", "app-team-acme-org")]
    #[case("blog.example.io", "example.io", "blog")]
    #[case("a.b.c.d", "b.c.d", "a")]
    #[case("example.io", "example.io", "")]
    #[case("localhost", "localhost", "")]
    fn host_parsing(#[case] host: &str, #[case] primary: &str, #[case] sub: &str) {
        assert_eq!(parse_host(host), (primary.to_string(), sub.to_string()));
    }

    #[rstest]
    #[case("app-team-acme-org.example.io", "team-acme-org", true)]
    #[case("team-acme-org.example.io", "team-acme-org", true)]
    #[case("app-other-ns.example.io", "team-acme-org", false)]
    #[case("app.example.io", "team-acme-org", false)]
    fn host_namespace_admissibility(
        #[case] host: &str,
        #[case] namespace: &str,
        #[case] admissible: bool,
    ) {
        assert_eq!(host_matches_namespace(host, namespace), admissible);
    }

    #[test]
    fn class_filter_accepts_unset_empty_and_kong() {
        let rules = || vec![ingress_rule("a-b-c.io", vec![])];
        assert!(is_kong_ingress(&ingress("ns", "i", &[], rules())));
        assert!(is_kong_ingress(&ingress(
            "ns",
            "i",
            &[(INGRESS_CLASS_KEY, "")],
            rules()
        )));
        assert!(is_kong_ingress(&ingress(
            "ns",
            "i",
            &[(INGRESS_CLASS_KEY, "kong")],
            rules()
        )));
        assert!(!is_kong_ingress(&ingress(
            "ns",
            "i",
            &[(INGRESS_CLASS_KEY, "nginx")],
            rules()
        )));
    }

    #[test]
    fn derived_domains_sort_primaries_first() {
        let ing = ingress(
            "team-acme-org",
            "web",
            &[("kolihub.io/acme.io", "primary")],
            vec![
                ingress_rule(
                    "app-team-acme-org.example.io",
                    vec![ingress_path("/", "web", 80)],
                ),
                ingress_rule("acme.io", vec![ingress_path("/", "web", 80)]),
            ],
        );
        let domains = hosts_from_ingress(&ing);
        assert_eq!(domains.len(), 2);
        assert!(domains[0].is_primary());
        assert_eq!(domains[0].spec.primary, "acme.io");
        assert_eq!(domains[0].name_any(), "acme-io");

        assert_eq!(domains[1].spec.primary, "example.io");
        assert_eq!(domains[1].spec.sub, "app-team-acme-org");
        assert_eq!(domains[1].name_any(), "app-team-acme-org-example-io");
        assert_eq!(
            domains[1].namespace().as_deref(),
            Some("team-acme-org")
        );
    }

    #[test]
    fn derived_shared_domains_carry_the_parent_annotation() {
        let ing = ingress(
            "team-acme-org",
            "web",
            &[(PARENT_ANNOTATION, "platform")],
            vec![ingress_rule(
                "app-team-acme-org.example.io",
                vec![ingress_path("/", "web", 80)],
            )],
        );
        let domains = hosts_from_ingress(&ing);
        assert_eq!(domains[0].spec.parent, "platform");
    }

    #[test]
    fn validation_enforces_rule_quota() {
        let rules: Vec<IngressRule> = (0..6)
            .map(|i| {
                ingress_rule(
                    &format!("app{i}-team-acme-org.example.io"),
                    vec![ingress_path("/", "web", 80)],
                )
            })
            .collect();
        let err = validate_ingress(&ingress("team-acme-org", "web", &[], rules)).unwrap_err();
        assert!(err.to_string().contains("quota"));
    }

    #[test]
    fn validation_enforces_path_quota() {
        let paths: Vec<HTTPIngressPath> = (0..6)
            .map(|i| ingress_path(&format!("/p{i}"), "web", 80))
            .collect();
        let ing = ingress(
            "team-acme-org",
            "web",
            &[],
            vec![ingress_rule("app-team-acme-org.example.io", paths)],
        );
        assert!(validate_ingress(&ing).is_err());
    }

    #[test]
    fn validation_rejects_mixed_backends_in_a_rule() {
        let ing = ingress(
            "team-acme-org",
            "web",
            &[],
            vec![ingress_rule(
                "app-team-acme-org.example.io",
                vec![
                    ingress_path("/", "web", 80),
                    ingress_path("/api", "api", 80),
                ],
            )],
        );
        let err = validate_ingress(&ing).unwrap_err();
        assert!(err.to_string().contains("share one service"));
    }

    #[test]
    fn validation_rejects_duplicate_and_foreign_hosts() {
        let dup = ingress(
            "team-acme-org",
            "web",
            &[],
            vec![
                ingress_rule(
                    "app-team-acme-org.example.io",
                    vec![ingress_path("/", "web", 80)],
                ),
                ingress_rule(
                    "app-team-acme-org.example.io",
                    vec![ingress_path("/api", "web", 80)],
                ),
            ],
        );
        assert!(validate_ingress(&dup).is_err());

        let foreign = ingress(
            "team-acme-org",
            "web",
            &[],
            vec![ingress_rule(
                "app-other-team.example.io",
                vec![ingress_path("/", "web", 80)],
            )],
        );
        assert!(validate_ingress(&foreign).is_err());
    }

    #[test]
    fn validation_accepts_a_well_formed_ingress() {
        let ing = ingress(
            "team-acme-org",
            "web",
            &[],
            vec![ingress_rule(
                "app-team-acme-org.example.io",
                vec![
                    ingress_path("/", "web", 80),
                    ingress_path("/api", "web", 80),
                ],
            )],
        );
        assert!(validate_ingress(&ing).is_ok());
    }

    #[rstest]
    #[case(80, "http://web.team-acme-org.svc.cluster.local:80")]
    #[case(443, "https://web.team-acme-org.svc.cluster.local:443")]
    #[case(8080, "http://web.team-acme-org.svc.cluster.local:8080")]
    fn upstream_scheme_follows_the_port(#[case] port: i32, #[case] expected: &str) {
        assert_eq!(
            upstream_url("svc.cluster.local", "team-acme-org", "web", port),
            expected
        );
    }

    #[test]
    fn apis_group_by_the_encoded_host() {
        let list = ApiList {
            total: 3,
            data: vec![
                Api {
                    name: Some("app.example.io~ns~300030".into()),
                    upstream_url: "http://a".into(),
                    ..Default::default()
                },
                Api {
                    name: Some("app.example.io~ns~32c016a".into()),
                    upstream_url: "http://a".into(),
                    ..Default::default()
                },
                Api {
                    name: Some("unmanaged-route".into()),
                    upstream_url: "http://b".into(),
                    ..Default::default()
                },
            ],
            ..Default::default()
        };
        let by_host = apis_by_host(&list);
        assert_eq!(by_host.len(), 1);
        assert_eq!(by_host["app.example.io"].len(), 2);
    }
}
