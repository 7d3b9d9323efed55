//! Nginx fragment rendering
//!
//! Pure translation of store-validated entities into nginx configuration
//! text. Rendering is total: inputs that would produce invalid syntax are
//! rejected by validation before they reach this module.

use std::fmt::Write;

use crate::models::{Certificate, DefaultRoute, DefaultRouteMode, LbMethod, ProxyHost};

/// Filename prefix for host fragments under sites-available/enabled.
pub const HOST_FILE_PREFIX: &str = "nubi-host-";

/// Fragment name of the default-route listener. Sorts before host files.
pub const DEFAULT_ROUTE_FILE: &str = "00-nubi-default";

/// Derive the fragment filename for a domain. `*` maps to `_wildcard_` and
/// `.` to `_`, which keeps the name a pure function of identity.
pub fn host_filename(domain: &str) -> String {
    let mangled = domain.replace('*', "_wildcard_").replace('.', "_");
    format!("{}{}.conf", HOST_FILE_PREFIX, mangled)
}

/// Derive the upstream block name for a load-balanced host.
pub fn upstream_name(domain: &str) -> String {
    let mangled: String = domain
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    format!("nubi_{}", mangled)
}

/// Render the fragment for one proxy host. `cert` must be the resolved
/// certificate when `host.certificate_id` is set.
pub fn render_proxy_host(host: &ProxyHost, cert: Option<&Certificate>) -> String {
    let mut out = String::new();

    writeln!(out, "# nubi host {}", host.id).unwrap();
    writeln!(out, "# domain: {}", host.domain).unwrap();
    writeln!(out).unwrap();

    let load_balanced = host.backends.len() >= 2;
    if load_balanced {
        let name = upstream_name(&host.domain);
        writeln!(out, "upstream {} {{", name).unwrap();
        match host.lb_method {
            LbMethod::LeastConn => writeln!(out, "    least_conn;").unwrap(),
            LbMethod::IpHash => writeln!(out, "    ip_hash;").unwrap(),
            LbMethod::RoundRobin => {}
        }
        for backend in &host.backends {
            let mut line = format!("    server {}", backend.address);
            if backend.weight > 1 {
                line.push_str(&format!(" weight={}", backend.weight));
            }
            if backend.backup {
                line.push_str(" backup");
            }
            writeln!(out, "{};", line).unwrap();
        }
        writeln!(out, "}}").unwrap();
        writeln!(out).unwrap();
    }

    writeln!(out, "server {{").unwrap();
    writeln!(out, "    listen 80;").unwrap();
    if host.ssl {
        writeln!(out, "    listen 443 ssl http2;").unwrap();
    }
    writeln!(out, "    server_name {};", host.domain).unwrap();

    if host.ssl && host.force_ssl {
        writeln!(out).unwrap();
        writeln!(out, "    if ($scheme = http) {{").unwrap();
        writeln!(out, "        return 301 https://$host$request_uri;").unwrap();
        writeln!(out, "    }}").unwrap();
    }

    if host.ssl {
        if let Some(cert) = cert {
            writeln!(out).unwrap();
            writeln!(out, "    ssl_certificate {};", cert.cert_path).unwrap();
            writeln!(out, "    ssl_certificate_key {};", cert.key_path).unwrap();
        }
    }

    writeln!(out).unwrap();
    writeln!(out, "    location / {{").unwrap();
    if host.maintenance {
        writeln!(out, "        default_type text/html;").unwrap();
        writeln!(
            out,
            "        return 503 '{}';",
            maintenance_page(&host.domain)
        )
        .unwrap();
    } else {
        let target = if load_balanced {
            format!("http://{}", upstream_name(&host.domain))
        } else if let Some(backend) = host.backends.first() {
            format!("http://{}", backend.address)
        } else {
            host.target.clone().unwrap_or_default()
        };
        writeln!(out, "        proxy_pass {};", target).unwrap();
        writeln!(out, "        proxy_http_version 1.1;").unwrap();
        writeln!(out, "        proxy_set_header Host $host;").unwrap();
        writeln!(out, "        proxy_set_header X-Real-IP $remote_addr;").unwrap();
        writeln!(
            out,
            "        proxy_set_header X-Forwarded-For $proxy_add_x_forwarded_for;"
        )
        .unwrap();
        writeln!(out, "        proxy_set_header X-Forwarded-Proto $scheme;").unwrap();
        if host.websocket {
            writeln!(out, "        proxy_set_header Upgrade $http_upgrade;").unwrap();
            writeln!(out, "        proxy_set_header Connection \"upgrade\";").unwrap();
            writeln!(out, "        proxy_read_timeout 3600s;").unwrap();
        }
    }
    writeln!(out, "    }}").unwrap();

    if let Some(custom) = host.custom_nginx.as_deref() {
        if !custom.trim().is_empty() {
            writeln!(out).unwrap();
            for line in custom.lines() {
                writeln!(out, "    {}", line).unwrap();
            }
        }
    }

    writeln!(out, "}}").unwrap();
    out
}

/// Render the `default_server` fragment. `html_dir` is where custom bodies
/// are materialized (`nubi_default.html`, `nubi_error_<code>.html`).
pub fn render_default_route(route: &DefaultRoute, html_dir: &str) -> String {
    let mut out = String::new();

    writeln!(out, "# nubi default route").unwrap();
    writeln!(out).unwrap();
    writeln!(out, "server {{").unwrap();
    writeln!(out, "    listen 80 default_server;").unwrap();
    writeln!(out, "    server_name _;").unwrap();
    writeln!(out).unwrap();

    // Counters endpoint for the telemetry scrape, loopback only.
    writeln!(out, "    location /.nubi/status {{").unwrap();
    writeln!(out, "        stub_status;").unwrap();
    writeln!(out, "        allow 127.0.0.1;").unwrap();
    writeln!(out, "        deny all;").unwrap();
    writeln!(out, "    }}").unwrap();
    writeln!(out).unwrap();

    match route.mode {
        DefaultRouteMode::NginxDefault => {
            writeln!(out, "    location / {{").unwrap();
            writeln!(out, "        root /var/www/html;").unwrap();
            writeln!(out, "        index index.html index.htm;").unwrap();
            writeln!(out, "        try_files $uri $uri/ =404;").unwrap();
            writeln!(out, "    }}").unwrap();
        }
        DefaultRouteMode::CustomHtml => {
            writeln!(out, "    root {};", html_dir).unwrap();
            writeln!(out, "    location / {{").unwrap();
            writeln!(out, "        try_files /nubi_default.html =404;").unwrap();
            writeln!(out, "    }}").unwrap();
        }
        DefaultRouteMode::ErrorCode => {
            let code = route.status_code.unwrap_or(444);
            writeln!(out, "    location / {{").unwrap();
            writeln!(out, "        return {};", code).unwrap();
            writeln!(out, "    }}").unwrap();
        }
        DefaultRouteMode::Proxy => {
            let target = route.target.as_deref().unwrap_or("http://127.0.0.1:80");
            writeln!(out, "    location / {{").unwrap();
            writeln!(out, "        proxy_pass {};", target).unwrap();
            writeln!(out, "        proxy_http_version 1.1;").unwrap();
            writeln!(out, "        proxy_set_header Host $host;").unwrap();
            writeln!(out, "        proxy_set_header X-Real-IP $remote_addr;").unwrap();
            writeln!(
                out,
                "        proxy_set_header X-Forwarded-For $proxy_add_x_forwarded_for;"
            )
            .unwrap();
            writeln!(out, "        proxy_set_header X-Forwarded-Proto $scheme;").unwrap();
            writeln!(out, "    }}").unwrap();
        }
        DefaultRouteMode::Redirect => {
            let target = route.target.as_deref().unwrap_or("/");
            writeln!(out, "    location / {{").unwrap();
            writeln!(out, "        return 301 {};", target).unwrap();
            writeln!(out, "    }}").unwrap();
        }
    }

    if !route.error_pages.is_empty() {
        writeln!(out).unwrap();
        for code in route.error_pages.keys() {
            writeln!(out, "    error_page {} /nubi_error_{}.html;", code, code).unwrap();
            writeln!(out, "    location = /nubi_error_{}.html {{", code).unwrap();
            writeln!(out, "        root {};", html_dir).unwrap();
            writeln!(out, "        internal;").unwrap();
            writeln!(out, "    }}").unwrap();
        }
    }

    writeln!(out, "}}").unwrap();
    out
}

/// HTML body shown while maintenance shadows the default route.
pub fn maintenance_html(message: &str) -> String {
    format!(
        "<!DOCTYPE html>\n<html>\n<head><title>Maintenance</title></head>\n\
         <body style=\"font-family: sans-serif; text-align: center; padding-top: 10%;\">\n\
         <h1>We&rsquo;ll be back soon</h1>\n<p>{}</p>\n</body>\n</html>\n",
        html_escape(message)
    )
}

/// Inline 503 body for a host flagged into maintenance.
fn maintenance_page(domain: &str) -> String {
    format!(
        "<html><head><title>Maintenance</title></head><body><h1>{} is under maintenance</h1></body></html>",
        domain
    )
}

fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('\'', "&#39;")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Backend;
    use chrono::Utc;
    use uuid::Uuid;

    fn host(domain: &str) -> ProxyHost {
        ProxyHost {
            id: Uuid::new_v4(),
            domain: domain.to_string(),
            target: Some("http://127.0.0.1:3000".to_string()),
            backends: vec![],
            lb_method: LbMethod::RoundRobin,
            ssl: false,
            force_ssl: false,
            certificate_id: None,
            websocket: false,
            maintenance: false,
            enabled: true,
            custom_nginx: None,
            tag_ids: vec![],
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_host_filename_mangling() {
        assert_eq!(
            host_filename("api.example.com"),
            "nubi-host-api_example_com.conf"
        );
        assert_eq!(
            host_filename("*.example.com"),
            "nubi-host-_wildcard__example_com.conf"
        );
    }

    #[test]
    fn test_upstream_name_mangling() {
        assert_eq!(upstream_name("lb.example.com"), "nubi_lb_example_com");
        assert_eq!(upstream_name("a-b.c"), "nubi_a_b_c");
    }

    #[test]
    fn test_render_is_deterministic() {
        let h = host("api.example.com");
        assert_eq!(render_proxy_host(&h, None), render_proxy_host(&h, None));
    }

    #[test]
    fn test_single_target_host() {
        let mut h = host("api.example.com");
        h.websocket = true;
        let conf = render_proxy_host(&h, None);
        assert_eq!(conf.matches("server {").count(), 1);
        assert!(conf.contains("listen 80;"));
        assert!(!conf.contains("listen 443"));
        assert!(conf.contains("proxy_pass http://127.0.0.1:3000;"));
        assert!(conf.contains("proxy_set_header Upgrade $http_upgrade;"));
        assert!(conf.contains(&format!("# nubi host {}", h.id)));
    }

    #[test]
    fn test_load_balanced_upstream() {
        let mut h = host("lb.example.com");
        h.target = None;
        h.backends = vec![
            Backend {
                address: "10.0.0.1:80".into(),
                weight: 3,
                backup: false,
            },
            Backend {
                address: "10.0.0.2:80".into(),
                weight: 1,
                backup: true,
            },
        ];
        h.lb_method = LbMethod::LeastConn;
        let conf = render_proxy_host(&h, None);
        assert!(conf.contains("upstream nubi_lb_example_com {"));
        assert!(conf.contains("least_conn;"));
        assert!(conf.contains("server 10.0.0.1:80 weight=3;"));
        assert!(conf.contains("server 10.0.0.2:80 backup;"));
        assert!(conf.contains("proxy_pass http://nubi_lb_example_com;"));
    }

    #[test]
    fn test_single_backend_skips_upstream_block() {
        let mut h = host("solo.example.com");
        h.target = None;
        h.backends = vec![Backend {
            address: "10.0.0.9:8080".into(),
            weight: 1,
            backup: false,
        }];
        let conf = render_proxy_host(&h, None);
        assert!(!conf.contains("upstream "));
        assert!(conf.contains("proxy_pass http://10.0.0.9:8080;"));
    }

    #[test]
    fn test_tls_block_references_bound_certificate() {
        let mut h = host("secure.example.com");
        h.ssl = true;
        h.force_ssl = true;
        let cert = Certificate {
            id: Uuid::new_v4(),
            name: "secure".into(),
            domains: vec!["secure.example.com".into()],
            cert_path: "/var/lib/nubi/certs/abc.crt".into(),
            key_path: "/var/lib/nubi/certs/abc.key".into(),
            chain_path: None,
            provenance: crate::models::CertProvenance::AcmeIssued,
            expires_at: Utc::now(),
            auto_renew: true,
            dns_challenge: None,
            tag_ids: vec![],
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let conf = render_proxy_host(&h, Some(&cert));
        assert!(conf.contains("listen 443 ssl http2;"));
        assert!(conf.contains("ssl_certificate /var/lib/nubi/certs/abc.crt;"));
        assert!(conf.contains("ssl_certificate_key /var/lib/nubi/certs/abc.key;"));
        assert!(conf.contains("if ($scheme = http)"));
        assert!(conf.contains("return 301 https://$host$request_uri;"));
    }

    #[test]
    fn test_maintenance_host_returns_503() {
        let mut h = host("down.example.com");
        h.maintenance = true;
        let conf = render_proxy_host(&h, None);
        assert!(conf.contains("return 503"));
        assert!(!conf.contains("proxy_pass"));
    }

    #[test]
    fn test_custom_directives_are_verbatim() {
        let mut h = host("api.example.com");
        h.custom_nginx = Some("client_max_body_size 50m;\ngzip on;".into());
        let conf = render_proxy_host(&h, None);
        assert!(conf.contains("client_max_body_size 50m;"));
        assert!(conf.contains("gzip on;"));
    }

    #[test]
    fn test_default_route_stub_status_guard() {
        let route = DefaultRoute::default();
        let conf = render_default_route(&route, "/var/lib/nubi/html");
        assert!(conf.contains("listen 80 default_server;"));
        assert!(conf.contains("location /.nubi/status"));
        assert!(conf.contains("stub_status;"));
        assert!(conf.contains("allow 127.0.0.1;"));
        assert!(conf.contains("deny all;"));
    }

    #[test]
    fn test_default_route_modes() {
        let mut route = DefaultRoute {
            enabled: true,
            mode: DefaultRouteMode::Proxy,
            target: Some("http://127.0.0.1:9000".into()),
            ..Default::default()
        };
        let conf = render_default_route(&route, "/var/lib/nubi/html");
        assert!(conf.contains("proxy_pass http://127.0.0.1:9000;"));

        route.mode = DefaultRouteMode::Redirect;
        route.target = Some("https://example.com".into());
        let conf = render_default_route(&route, "/var/lib/nubi/html");
        assert!(conf.contains("return 301 https://example.com;"));

        route.mode = DefaultRouteMode::ErrorCode;
        route.status_code = Some(410);
        let conf = render_default_route(&route, "/var/lib/nubi/html");
        assert!(conf.contains("return 410;"));
    }

    #[test]
    fn test_default_route_error_pages() {
        let mut route = DefaultRoute {
            enabled: true,
            mode: DefaultRouteMode::CustomHtml,
            custom_html: Some("<h1>hi</h1>".into()),
            ..Default::default()
        };
        route.error_pages.insert(404, "<h1>gone</h1>".into());
        route.error_pages.insert(502, "<h1>bad</h1>".into());
        let conf = render_default_route(&route, "/var/lib/nubi/html");
        assert!(conf.contains("error_page 404 /nubi_error_404.html;"));
        assert!(conf.contains("error_page 502 /nubi_error_502.html;"));
        assert!(conf.contains("try_files /nubi_default.html =404;"));
    }

    #[test]
    fn test_maintenance_html_escapes_message() {
        let body = maintenance_html("Be right back <soon>");
        assert!(body.contains("Be right back &lt;soon&gt;"));
    }
}
