//! Product catalog and symbol parsing.
//!
//! The gateway serves a fixed set of bond futures under short internal codes.
//! A request symbol is either a bare product code (`EURBBL`, continuous
//! front month) or a code with a month suffix (`EURBBLM25`, a specific
//! expiry). The suffix is recognized only when the prefix is a known
//! product; otherwise the whole symbol is treated as one code so that
//! arbitrary tickers like `AAPL` still pass through.

use ibgate_tws::Contract;

/// One catalog entry: the broker-side symbol and venue for a product code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProductSpec {
    pub code: &'static str,
    pub symbol: &'static str,
    pub sec_type: &'static str,
    pub exchange: &'static str,
    pub currency: &'static str,
    pub description: &'static str,
}

/// Government bond futures served by the gateway.
pub const PRODUCTS: &[ProductSpec] = &[
    ProductSpec {
        code: "UKGB",
        symbol: "G",
        sec_type: "CONTFUT",
        exchange: "LIFFE",
        currency: "GBP",
        description: "UK Long Gilt future",
    },
    ProductSpec {
        code: "UST10Y",
        symbol: "ZN",
        sec_type: "CONTFUT",
        exchange: "CBOT",
        currency: "USD",
        description: "US 10-Year T-Note future",
    },
    ProductSpec {
        code: "UST05Y",
        symbol: "ZF",
        sec_type: "CONTFUT",
        exchange: "CBOT",
        currency: "USD",
        description: "US 5-Year T-Note future",
    },
    ProductSpec {
        code: "UST30Y",
        symbol: "ZB",
        sec_type: "CONTFUT",
        exchange: "CBOT",
        currency: "USD",
        description: "US 30-Year T-Bond future",
    },
    ProductSpec {
        code: "EURBBL",
        symbol: "FGBL",
        sec_type: "CONTFUT",
        exchange: "EUREX",
        currency: "EUR",
        description: "Euro-Bund future",
    },
    ProductSpec {
        code: "EURSCA",
        symbol: "FGBS",
        sec_type: "CONTFUT",
        exchange: "EUREX",
        currency: "EUR",
        description: "Euro-Schatz future",
    },
    ProductSpec {
        code: "ITB10Y",
        symbol: "FBTP",
        sec_type: "CONTFUT",
        exchange: "EUREX",
        currency: "EUR",
        description: "Euro-BTP future",
    },
    ProductSpec {
        code: "EURBND",
        symbol: "GBL",
        sec_type: "CONTFUT",
        exchange: "EUREX",
        currency: "EUR",
        description: "Euro-Bund future (GBL)",
    },
];

pub fn lookup(code: &str) -> Option<&'static ProductSpec> {
    PRODUCTS.iter().find(|p| p.code == code)
}

/// Split a request symbol into a product code and an optional month suffix.
///
/// The last three characters are a month suffix (e.g. `M25`) only when the
/// remaining prefix is a catalog code. Anything else is a plain code with
/// no month.
pub fn parse_symbol(symbol: &str) -> (&str, Option<&str>) {
    if symbol.len() > 3 {
        let (prefix, suffix) = symbol.split_at(symbol.len() - 3);
        if lookup(prefix).is_some() {
            return (prefix, Some(suffix));
        }
    }
    (symbol, None)
}

/// Build the broker contract description for a request symbol.
///
/// Codes are case-insensitive; the symbol is uppercased before the catalog
/// lookup and the fallback. Known codes map through the catalog. A month
/// suffix switches the security type from continuous future to a dated
/// `FUT` with the expiry carried in the local symbol. Unknown codes fall
/// back to a SMART-routed US stock so the resolver can still ask the
/// broker.
pub fn contract_for_symbol(symbol: &str) -> Contract {
    let symbol = symbol.to_ascii_uppercase();
    let (code, month) = parse_symbol(&symbol);

    match lookup(code) {
        Some(spec) => {
            let mut contract = Contract {
                symbol: spec.symbol.to_string(),
                sec_type: spec.sec_type.to_string(),
                exchange: spec.exchange.to_string(),
                currency: spec.currency.to_string(),
                ..Default::default()
            };
            if let Some(month) = month {
                contract.sec_type = "FUT".to_string();
                contract.local_symbol = format!("{}{}", spec.symbol, month);
            }
            contract
        }
        None => Contract {
            symbol,
            sec_type: "STK".to_string(),
            exchange: "SMART".to_string(),
            currency: "USD".to_string(),
            ..Default::default()
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_month_suffix_for_known_product() {
        assert_eq!(parse_symbol("EURBBLM25"), ("EURBBL", Some("M25")));
        assert_eq!(parse_symbol("UST10YZ26"), ("UST10Y", Some("Z26")));
    }

    #[test]
    fn keeps_unknown_prefix_whole() {
        // "AAPLM25" is not a catalog code + month; the whole string is the code.
        assert_eq!(parse_symbol("AAPLM25"), ("AAPLM25", None));
        assert_eq!(parse_symbol("MSFT"), ("MSFT", None));
    }

    #[test]
    fn short_symbols_never_split() {
        assert_eq!(parse_symbol("ZN"), ("ZN", None));
        assert_eq!(parse_symbol("G"), ("G", None));
        assert_eq!(parse_symbol("FGB"), ("FGB", None));
    }

    #[test]
    fn continuous_contract_for_bare_code() {
        let c = contract_for_symbol("EURBBL");
        assert_eq!(c.symbol, "FGBL");
        assert_eq!(c.sec_type, "CONTFUT");
        assert_eq!(c.exchange, "EUREX");
        assert_eq!(c.currency, "EUR");
        assert_eq!(c.local_symbol, "");
    }

    #[test]
    fn dated_contract_for_code_with_month() {
        let c = contract_for_symbol("EURBBLM25");
        assert_eq!(c.symbol, "FGBL");
        assert_eq!(c.sec_type, "FUT");
        assert_eq!(c.local_symbol, "FGBLM25");
        assert_eq!(c.exchange, "EUREX");
    }

    #[test]
    fn lowercase_code_resolves_through_catalog() {
        let c = contract_for_symbol("eurbbl");
        assert_eq!(c.symbol, "FGBL");
        assert_eq!(c.sec_type, "CONTFUT");
        assert_eq!(c.exchange, "EUREX");
        assert_eq!(c.currency, "EUR");

        let dated = contract_for_symbol("eurbblm25");
        assert_eq!(dated.sec_type, "FUT");
        assert_eq!(dated.local_symbol, "FGBLM25");

        // Unknown codes are uppercased too before the stock fallback.
        let stock = contract_for_symbol("aapl");
        assert_eq!(stock.symbol, "AAPL");
        assert_eq!(stock.sec_type, "STK");
    }

    #[test]
    fn unknown_code_falls_back_to_smart_stock() {
        let c = contract_for_symbol("AAPL");
        assert_eq!(c.symbol, "AAPL");
        assert_eq!(c.sec_type, "STK");
        assert_eq!(c.exchange, "SMART");
        assert_eq!(c.currency, "USD");
    }

    #[test]
    fn catalog_covers_all_venues() {
        assert_eq!(PRODUCTS.len(), 8);
        assert!(lookup("UKGB").is_some());
        assert_eq!(lookup("UST30Y").map(|p| p.symbol), Some("ZB"));
        assert!(lookup("XXX").is_none());
    }
}
