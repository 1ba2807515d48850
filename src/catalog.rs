use crate::models::{ItemDescription, Retailer, RetailerLink};
use urlencoding::encode;

#[derive(Clone, Copy)]
pub struct RetailerDefinition {
    pub retailer: Retailer,
    search_prefix: &'static str,
}

/// Declaration order is emission order.
pub const RETAILERS: [RetailerDefinition; 3] = [
    RetailerDefinition {
        retailer: Retailer::Asos,
        search_prefix: "https://www.asos.com/search/?q=",
    },
    RetailerDefinition {
        retailer: Retailer::HAndM,
        search_prefix: "https://www2.hm.com/en_gb/search-results.html?q=",
    },
    RetailerDefinition {
        retailer: Retailer::Zara,
        search_prefix: "https://www.zara.com/dk/en/search?searchTerm=",
    },
];

pub fn links_for(item: &ItemDescription) -> Vec<RetailerLink> {
    let query = encode(item.as_str());
    RETAILERS
        .iter()
        .map(|definition| RetailerLink {
            retailer: definition.retailer,
            url: format!("{}{}", definition.search_prefix, query),
            item: item.clone(),
        })
        .collect()
}
