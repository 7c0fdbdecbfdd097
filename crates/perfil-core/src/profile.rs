//! Company profile: the structured document produced by the profile
//! stage, plus the post-parse normalization and cross-chunk merge that
//! never trust the model.

use serde::{Deserialize, Serialize};

// Hard numeric caps per section. The schema advertises them as hints;
// normalization enforces them.
pub const MAX_ITEMS_PER_CATEGORY: usize = 60;
pub const MAX_CATEGORIES: usize = 40;
pub const MAX_SERVICES: usize = 50;
pub const MAX_CLIENTS: usize = 80;
pub const MAX_PARTNERSHIPS: usize = 50;
pub const MAX_CERTIFICATIONS: usize = 50;
pub const MAX_CASE_STUDIES: usize = 30;

/// Items admitted per 3-word prefix before the anti-template rule drops
/// the rest.
pub const TEMPLATE_PREFIX_LIMIT: usize = 5;

// Catch-all category names the model invents under pressure; dropped.
const INVALID_CATEGORY_NAMES: &[&str] = &[
    "outras categorias",
    "outras",
    "outros",
    "marcas",
    "marca",
    "geral",
    "diversos",
    "categorias",
    "categoria",
    "produtos",
    "produto",
    "serviços",
    "servicos",
    "serviço",
    "servico",
];

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Identity {
    pub company_name: Option<String>,
    pub tax_id: Option<String>,
    pub description: Option<String>,
    pub founding_year: Option<i32>,
    pub employee_range: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Classification {
    pub industry: Option<String>,
    pub business_model: Option<String>,
    pub target_audience: Option<String>,
    pub geographic_coverage: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProductCategory {
    pub name: String,
    pub items: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Service {
    pub name: String,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Offerings {
    pub product_categories: Vec<ProductCategory>,
    pub services: Vec<Service>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaseStudy {
    pub title: String,
    pub client_name: Option<String>,
    pub industry: Option<String>,
    pub challenge: Option<String>,
    pub solution: Option<String>,
    pub outcome: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Reputation {
    pub certifications: Vec<String>,
    pub awards: Vec<String>,
    pub partnerships: Vec<String>,
    pub client_list: Vec<String>,
    pub case_studies: Vec<CaseStudy>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Contact {
    pub emails: Vec<String>,
    pub phones: Vec<String>,
    pub linkedin_url: Option<String>,
    pub website_url: Option<String>,
    pub headquarters_address: Option<String>,
    pub locations: Vec<String>,
}

/// The structured profile document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompanyProfile {
    pub identity: Identity,
    pub classification: Classification,
    pub offerings: Offerings,
    pub reputation: Reputation,
    pub contact: Contact,
    pub sources: Vec<String>,
}

impl CompanyProfile {
    /// True when no field carries data; used by the merge to skip empty
    /// chunk contributions.
    pub fn is_empty(&self) -> bool {
        self == &CompanyProfile::default()
    }
}

/// Case-folded, whitespace-normalized dedup key.
pub fn dedup_key(s: &str) -> String {
    s.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

fn dedup_list(list: &mut Vec<String>) {
    let mut seen = std::collections::HashSet::new();
    list.retain(|item| {
        let trimmed = item.trim();
        !trimmed.is_empty() && seen.insert(dedup_key(trimmed))
    });
}

/// Drop items sharing an already-saturated 3-word prefix.
///
/// Template degeneration produces long runs like "Produto de qualidade A",
/// "Produto de qualidade B", …; once a prefix has admitted
/// [`TEMPLATE_PREFIX_LIMIT`] items, further ones are dropped.
pub fn apply_anti_template(items: &mut Vec<String>) {
    let mut prefix_counts: std::collections::HashMap<String, usize> =
        std::collections::HashMap::new();
    items.retain(|item| {
        let key = dedup_key(item);
        let prefix: String = key.split(' ').take(3).collect::<Vec<_>>().join(" ");
        let count = prefix_counts.entry(prefix).or_insert(0);
        if *count >= TEMPLATE_PREFIX_LIMIT {
            return false;
        }
        *count += 1;
        true
    });
}

/// Post-parse normalization. Runs unconditionally on every chunk profile
/// and again after the merge: dedup every list with case-folded keys,
/// apply the anti-template rule to category items, enforce every cap.
pub fn normalize(profile: &mut CompanyProfile) {
    // Product categories: drop catch-all and empty names, merge same-name
    // categories, then clean each item list.
    let mut merged: Vec<ProductCategory> = Vec::new();
    for category in profile.offerings.product_categories.drain(..) {
        let name = category.name.trim().to_string();
        if name.is_empty() || INVALID_CATEGORY_NAMES.contains(&dedup_key(&name).as_str()) {
            continue;
        }
        let key = dedup_key(&name);
        match merged.iter_mut().find(|c| dedup_key(&c.name) == key) {
            Some(existing) => existing.items.extend(category.items),
            None => merged.push(ProductCategory {
                name,
                items: category.items,
            }),
        }
    }
    for category in &mut merged {
        dedup_list(&mut category.items);
        apply_anti_template(&mut category.items);
        category.items.truncate(MAX_ITEMS_PER_CATEGORY);
    }
    merged.truncate(MAX_CATEGORIES);
    profile.offerings.product_categories = merged;

    // Services: dedup by name, keep the first description seen.
    let mut seen = std::collections::HashSet::new();
    profile.offerings.services.retain(|s| {
        let trimmed = s.name.trim();
        !trimmed.is_empty() && seen.insert(dedup_key(trimmed))
    });
    profile.offerings.services.truncate(MAX_SERVICES);

    dedup_list(&mut profile.reputation.certifications);
    profile.reputation.certifications.truncate(MAX_CERTIFICATIONS);
    dedup_list(&mut profile.reputation.awards);
    dedup_list(&mut profile.reputation.partnerships);
    profile.reputation.partnerships.truncate(MAX_PARTNERSHIPS);
    dedup_list(&mut profile.reputation.client_list);
    profile.reputation.client_list.truncate(MAX_CLIENTS);

    // Case studies: synthesize a title when the model forgot one, then
    // dedup on title + client.
    let mut seen = std::collections::HashSet::new();
    let mut kept = Vec::new();
    for mut case in profile.reputation.case_studies.drain(..) {
        if case.title.trim().is_empty() {
            case.title = match (&case.client_name, &case.challenge) {
                (Some(client), _) if !client.trim().is_empty() => format!("Caso: {client}"),
                (_, Some(challenge)) if !challenge.trim().is_empty() => {
                    format!("Desafio: {}", truncate_chars(challenge, 50))
                }
                _ => continue,
            };
        }
        if seen.insert(case_key(&case)) {
            kept.push(case);
        }
    }
    kept.truncate(MAX_CASE_STUDIES);
    profile.reputation.case_studies = kept;

    dedup_list(&mut profile.contact.emails);
    dedup_list(&mut profile.contact.phones);
    dedup_list(&mut profile.contact.locations);
    dedup_list(&mut profile.sources);
}

fn case_key(case: &CaseStudy) -> String {
    format!(
        "{}|{}",
        dedup_key(&case.title),
        case.client_name.as_deref().map(dedup_key).unwrap_or_default()
    )
}

fn truncate_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

// ---------------------------------------------------------------------------
// Merge
// ---------------------------------------------------------------------------

/// Word-overlap similarity threshold under which two descriptions are
/// considered complementary rather than duplicates.
const COMPLEMENTARY_SIMILARITY: f64 = 0.3;

/// Merge partial profiles from sequential chunk calls into one document.
///
/// Scalars: first non-null wins, except description where a strictly
/// longer later value replaces (clearly complementary descriptions are
/// concatenated instead). Lists: union with the shared dedup key, caps
/// re-applied. Case studies: keyed on title + client, conflicting fields
/// resolved longer-non-null-wins.
pub fn merge_profiles(partials: Vec<CompanyProfile>) -> CompanyProfile {
    let mut merged = CompanyProfile::default();

    for partial in partials {
        if partial.is_empty() {
            continue;
        }
        merge_identity(&mut merged.identity, partial.identity);
        merge_classification(&mut merged.classification, partial.classification);
        merge_offerings(&mut merged.offerings, partial.offerings);
        merge_reputation(&mut merged.reputation, partial.reputation);
        merge_contact(&mut merged.contact, partial.contact);
        merged.sources.extend(partial.sources);
    }

    normalize(&mut merged);
    merged
}

fn first_wins(slot: &mut Option<String>, candidate: Option<String>) {
    if slot.as_deref().map(str::trim).is_none_or(str::is_empty)
        && let Some(value) = candidate
        && !value.trim().is_empty()
    {
        *slot = Some(value);
    }
}

/// Descriptions are the one field where a later, richer chunk should win.
fn merge_description(slot: &mut Option<String>, candidate: Option<String>) {
    let Some(new) = candidate.filter(|v| !v.trim().is_empty()) else {
        return;
    };
    match slot {
        None => *slot = Some(new),
        Some(current) => {
            if texts_complementary(current, &new) {
                *slot = Some(format!("{}. {}", current.trim_end_matches('.'), new.trim()));
            } else if new.chars().count() > current.chars().count() {
                *slot = Some(new);
            }
        }
    }
}

fn texts_complementary(a: &str, b: &str) -> bool {
    let a_lower = a.to_lowercase();
    let b_lower = b.to_lowercase();
    if a_lower.contains(b_lower.trim()) || b_lower.contains(a_lower.trim()) {
        return false;
    }
    let wa: std::collections::HashSet<&str> = a_lower.split_whitespace().collect();
    let wb: std::collections::HashSet<&str> = b_lower.split_whitespace().collect();
    if wa.is_empty() || wb.is_empty() {
        return false;
    }
    let overlap = wa.intersection(&wb).count() as f64;
    overlap / (wa.len().max(wb.len()) as f64) < COMPLEMENTARY_SIMILARITY
}

fn merge_identity(merged: &mut Identity, partial: Identity) {
    first_wins(&mut merged.company_name, partial.company_name);
    first_wins(&mut merged.tax_id, partial.tax_id);
    merge_description(&mut merged.description, partial.description);
    if merged.founding_year.is_none() {
        merged.founding_year = partial.founding_year;
    }
    first_wins(&mut merged.employee_range, partial.employee_range);
}

fn merge_classification(merged: &mut Classification, partial: Classification) {
    first_wins(&mut merged.industry, partial.industry);
    first_wins(&mut merged.business_model, partial.business_model);
    first_wins(&mut merged.target_audience, partial.target_audience);
    first_wins(&mut merged.geographic_coverage, partial.geographic_coverage);
}

fn merge_offerings(merged: &mut Offerings, partial: Offerings) {
    // Same-name categories union their items; normalize dedups later.
    for category in partial.product_categories {
        let key = dedup_key(&category.name);
        match merged
            .product_categories
            .iter_mut()
            .find(|c| dedup_key(&c.name) == key)
        {
            Some(existing) => existing.items.extend(category.items),
            None => merged.product_categories.push(category),
        }
    }
    for service in partial.services {
        let key = dedup_key(&service.name);
        match merged
            .services
            .iter_mut()
            .find(|s| dedup_key(&s.name) == key)
        {
            Some(existing) => {
                if longer(&service.description, &existing.description) {
                    existing.description = service.description;
                }
            }
            None => merged.services.push(service),
        }
    }
}

fn longer(candidate: &Option<String>, current: &Option<String>) -> bool {
    let c = candidate.as_deref().map_or(0, |s| s.chars().count());
    let e = current.as_deref().map_or(0, |s| s.chars().count());
    c > e
}

fn merge_reputation(merged: &mut Reputation, partial: Reputation) {
    merged.certifications.extend(partial.certifications);
    merged.awards.extend(partial.awards);
    merged.partnerships.extend(partial.partnerships);
    merged.client_list.extend(partial.client_list);

    for case in partial.case_studies {
        let key = case_key(&case);
        match merged.case_mut(&key) {
            Some(existing) => {
                if longer(&case.challenge, &existing.challenge) {
                    existing.challenge = case.challenge;
                }
                if longer(&case.solution, &existing.solution) {
                    existing.solution = case.solution;
                }
                if longer(&case.outcome, &existing.outcome) {
                    existing.outcome = case.outcome;
                }
                if longer(&case.industry, &existing.industry) {
                    existing.industry = case.industry;
                }
                if longer(&case.client_name, &existing.client_name) {
                    existing.client_name = case.client_name;
                }
            }
            None => merged.case_studies.push(case),
        }
    }
}

impl Reputation {
    fn case_mut(&mut self, key: &str) -> Option<&mut CaseStudy> {
        self.case_studies.iter_mut().find(|c| case_key(c) == key)
    }
}

fn merge_contact(merged: &mut Contact, partial: Contact) {
    merged.emails.extend(partial.emails);
    merged.phones.extend(partial.phones);
    merged.locations.extend(partial.locations);
    first_wins(&mut merged.linkedin_url, partial.linkedin_url);
    first_wins(&mut merged.website_url, partial.website_url);
    first_wins(&mut merged.headquarters_address, partial.headquarters_address);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile_with_items(category: &str, items: &[&str]) -> CompanyProfile {
        CompanyProfile {
            offerings: Offerings {
                product_categories: vec![ProductCategory {
                    name: category.into(),
                    items: items.iter().map(|s| s.to_string()).collect(),
                }],
                services: vec![],
            },
            ..Default::default()
        }
    }

    #[test]
    fn dedup_key_folds_case_and_whitespace() {
        assert_eq!(dedup_key("  Cabo   Flex 750V "), "cabo flex 750v");
        assert_eq!(dedup_key("CABO FLEX 750V"), "cabo flex 750v");
    }

    #[test]
    fn normalize_dedups_case_insensitively() {
        let mut profile = profile_with_items("Conectores", &["RCA", "rca", " RCA ", "P2"]);
        normalize(&mut profile);
        assert_eq!(
            profile.offerings.product_categories[0].items,
            vec!["RCA", "P2"]
        );
    }

    #[test]
    fn anti_template_caps_shared_prefixes() {
        let items: Vec<String> = (0..12)
            .map(|i| format!("Produto de qualidade {i}"))
            .collect();
        let mut items = items;
        apply_anti_template(&mut items);
        assert_eq!(items.len(), TEMPLATE_PREFIX_LIMIT);

        // Distinct prefixes are untouched.
        let mut distinct = vec![
            "RCA".to_string(),
            "P2".to_string(),
            "P10".to_string(),
            "XLR".to_string(),
        ];
        apply_anti_template(&mut distinct);
        assert_eq!(distinct, vec!["RCA", "P2", "P10", "XLR"]);
    }

    #[test]
    fn normalize_enforces_caps() {
        let items: Vec<String> = (0..100).map(|i| format!("Cabo modelo {i}A")).collect();
        let mut profile = profile_with_items("Cabos", &[]);
        profile.offerings.product_categories[0].items =
            items.iter().map(String::from).collect();
        profile.reputation.client_list = (0..120).map(|i| format!("Cliente {i}")).collect();
        normalize(&mut profile);

        // Model numbers make the 3-word prefixes distinct, so only the
        // per-category cap binds.
        assert_eq!(
            profile.offerings.product_categories[0].items.len(),
            MAX_ITEMS_PER_CATEGORY
        );
        assert_eq!(profile.reputation.client_list.len(), MAX_CLIENTS);
    }

    #[test]
    fn normalize_drops_catch_all_categories() {
        let mut profile = CompanyProfile {
            offerings: Offerings {
                product_categories: vec![
                    ProductCategory {
                        name: "Outros".into(),
                        items: vec!["coisa".into()],
                    },
                    ProductCategory {
                        name: "Cabos".into(),
                        items: vec!["Cabo 1KV".into()],
                    },
                ],
                services: vec![],
            },
            ..Default::default()
        };
        normalize(&mut profile);
        assert_eq!(profile.offerings.product_categories.len(), 1);
        assert_eq!(profile.offerings.product_categories[0].name, "Cabos");
    }

    #[test]
    fn normalize_synthesizes_case_study_titles() {
        let mut profile = CompanyProfile::default();
        profile.reputation.case_studies = vec![
            CaseStudy {
                title: "".into(),
                client_name: Some("Metalúrgica Sul".into()),
                ..Default::default()
            },
            CaseStudy {
                title: "".into(),
                ..Default::default()
            },
        ];
        normalize(&mut profile);
        assert_eq!(profile.reputation.case_studies.len(), 1);
        assert_eq!(profile.reputation.case_studies[0].title, "Caso: Metalúrgica Sul");
    }

    #[test]
    fn merge_unions_categories_and_reapplies_caps() {
        let a = profile_with_items("Conectores", &["RCA", "P2"]);
        let b = profile_with_items("conectores", &["P2", "P10", "XLR"]);
        let merged = merge_profiles(vec![a, b]);

        assert_eq!(merged.offerings.product_categories.len(), 1);
        assert_eq!(
            merged.offerings.product_categories[0].items,
            vec!["RCA", "P2", "P10", "XLR"]
        );
    }

    #[test]
    fn merge_scalar_first_non_null_wins() {
        let mut a = CompanyProfile::default();
        a.identity.company_name = Some("Example Ltda".into());
        let mut b = CompanyProfile::default();
        b.identity.company_name = Some("Example Comercio Ltda".into());
        b.classification.industry = Some("Eletroeletrônico".into());

        let merged = merge_profiles(vec![a, b]);
        assert_eq!(merged.identity.company_name.as_deref(), Some("Example Ltda"));
        assert_eq!(
            merged.classification.industry.as_deref(),
            Some("Eletroeletrônico")
        );
    }

    #[test]
    fn merge_description_longest_wins() {
        // The shorter text is a prefix of the longer one, so the pair is
        // a duplicate (not complementary) and the longer value wins.
        let mut a = CompanyProfile::default();
        a.identity.description = Some("Fabricante de cabos elétricos".into());
        let mut b = CompanyProfile::default();
        b.identity.description =
            Some("Fabricante de cabos elétricos com 30 anos de mercado no Brasil".into());

        let merged = merge_profiles(vec![a, b]);
        assert_eq!(
            merged.identity.description.as_deref(),
            Some("Fabricante de cabos elétricos com 30 anos de mercado no Brasil")
        );

        // Order reversed: the longer earlier value survives.
        let mut a = CompanyProfile::default();
        a.identity.description =
            Some("Fabricante de cabos elétricos com 30 anos de mercado no Brasil".into());
        let mut b = CompanyProfile::default();
        b.identity.description = Some("Fabricante de cabos elétricos".into());
        let merged = merge_profiles(vec![a, b]);
        assert_eq!(
            merged.identity.description.as_deref(),
            Some("Fabricante de cabos elétricos com 30 anos de mercado no Brasil")
        );
    }

    #[test]
    fn merge_concatenates_complementary_descriptions() {
        let mut a = CompanyProfile::default();
        a.identity.description = Some("Fabricante de cabos elétricos.".into());
        let mut b = CompanyProfile::default();
        b.identity.description = Some("Atende os mercados industrial e naval.".into());

        let merged = merge_profiles(vec![a, b]);
        let description = merged.identity.description.unwrap();
        assert!(description.contains("Fabricante de cabos elétricos"));
        assert!(description.contains("Atende os mercados industrial e naval"));
    }

    #[test]
    fn merge_case_studies_by_title_and_client() {
        let mut a = CompanyProfile::default();
        a.reputation.case_studies = vec![CaseStudy {
            title: "Modernização da planta".into(),
            client_name: Some("Metalúrgica Sul".into()),
            solution: Some("Troca de painéis.".into()),
            ..Default::default()
        }];
        let mut b = CompanyProfile::default();
        b.reputation.case_studies = vec![CaseStudy {
            title: "Modernização da planta".into(),
            client_name: Some("Metalúrgica Sul".into()),
            solution: Some("Troca de painéis e retrofit completo da automação.".into()),
            outcome: Some("Redução de 20% no consumo.".into()),
            ..Default::default()
        }];

        let merged = merge_profiles(vec![a, b]);
        assert_eq!(merged.reputation.case_studies.len(), 1);
        let case = &merged.reputation.case_studies[0];
        assert!(case.solution.as_deref().unwrap().contains("retrofit"));
        assert_eq!(case.outcome.as_deref(), Some("Redução de 20% no consumo."));
    }

    #[test]
    fn merged_lists_have_no_duplicate_keys_and_respect_caps() {
        let mut a = CompanyProfile::default();
        a.reputation.client_list = (0..60).map(|i| format!("Cliente {i}")).collect();
        let mut b = CompanyProfile::default();
        b.reputation.client_list = (30..120).map(|i| format!("cliente {i}")).collect();

        let merged = merge_profiles(vec![a, b]);
        assert_eq!(merged.reputation.client_list.len(), MAX_CLIENTS);
        let mut keys: Vec<String> = merged
            .reputation
            .client_list
            .iter()
            .map(|c| dedup_key(c))
            .collect();
        let before = keys.len();
        keys.sort();
        keys.dedup();
        assert_eq!(keys.len(), before);
    }

    #[test]
    fn empty_partials_are_skipped() {
        let merged = merge_profiles(vec![
            CompanyProfile::default(),
            CompanyProfile::default(),
        ]);
        assert!(merged.is_empty());
    }

    #[test]
    fn profile_deserializes_with_missing_sections() {
        let json = r#"{"identity": {"company_name": "Example Ltda"}}"#;
        let profile: CompanyProfile = serde_json::from_str(json).unwrap();
        assert_eq!(profile.identity.company_name.as_deref(), Some("Example Ltda"));
        assert!(profile.offerings.product_categories.is_empty());
    }
}
