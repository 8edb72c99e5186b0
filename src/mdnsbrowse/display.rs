//! Terminal output for discovered services.
use mdnslib::cache::CachedService;
use mdnslib::client::DiscoveryListener;

/// Prints every discovery transition as it happens.
pub struct PrintListener;

impl DiscoveryListener for PrintListener {
    fn on_service_name_discovered(&self, service: &CachedService, from_cache: bool) {
        let origin = if from_cache { "cache" } else { "network" };
        println!("+ name    {} ({})", service.service_name, origin);
    }

    fn on_service_found(&self, service: &CachedService, _from_cache: bool) {
        println!("+ found   {}", describe(service));
    }

    fn on_service_updated(&self, service: &CachedService) {
        println!("~ updated {}", describe(service));
    }

    fn on_service_removed(&self, service: &CachedService) {
        println!("- removed {}", service.service_name);
    }
}

pub fn describe(service: &CachedService) -> String {
    let mut out = service.service_name.to_string();

    if let (Some(host), Some(port)) = (service.target_host(), service.port()) {
        out.push_str(&format!(" -> {}:{}", host, port));
    }
    for addr in service.addresses() {
        out.push_str(&format!(" [{}]", addr));
    }

    let txt = service.txt_entries();
    if !txt.is_empty() {
        out.push_str(" {");
        for (i, entry) in txt.iter().enumerate() {
            if i > 0 {
                out.push(' ');
            }
            match &entry.value {
                Some(v) => out.push_str(&format!("{}={}", entry.key, String::from_utf8_lossy(v))),
                None => out.push_str(&entry.key),
            }
        }
        out.push('}');
    }

    let subtypes = service.subtypes();
    if !subtypes.is_empty() {
        out.push_str(&format!(" subtypes={:?}", subtypes));
    }

    out
}
