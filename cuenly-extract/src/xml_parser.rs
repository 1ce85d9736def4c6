//! C7: the deterministic SIFEN XML parser. Locates the `DE` element by
//! local name at any depth, extracts the CDC strictly from its `Id`
//! attribute, and maps recognized fields to the canonical schema.

use quick_xml::{events::Event, Reader};
use regex::Regex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::instrument;

use cuenly_common::model::{Cdc, Currency, InvoiceItem};

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("XML is not well-formed, and byte-level <DE> recovery also failed")]
    Unrecoverable,
    #[error("no `DE` element found")]
    NoDeElement,
}

/// The raw, not-yet-canonicalized fields pulled out of a `DE` element.
/// Kept separate from [`cuenly_common::model::InvoiceHeader`] because this
/// parser doesn't know the tenant or artifact key; the caller maps this
/// into a full header.
///
/// Also the deserialization target for the vision extractor's normalized
/// JSON (`cuenly-extract::vision`): the vision prompt asks the model for
/// exactly this field set, so a single [`crate::mapper`] function builds
/// the canonical header from either source.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ParsedInvoice {
    pub cdc: Option<Cdc>,
    pub fecha: Option<chrono::NaiveDate>,
    pub numero_factura: Option<String>,
    pub timbrado: Option<String>,
    pub ruc_emisor: Option<String>,
    pub razon_social_emisor: Option<String>,
    pub receptor_ruc: Option<String>,
    pub receptor_nombre: Option<String>,
    pub receptor_email: Option<String>,
    pub moneda: Currency,
    pub tipo_cambio: Decimal,
    pub gravado_5: Decimal,
    pub gravado_10: Decimal,
    pub exento: Decimal,
    pub iva_5: Decimal,
    pub iva_10: Decimal,
    pub total: Decimal,
    pub items: Vec<InvoiceItem>,
}

impl ParsedInvoice {
    /// `true` once the document carries the minimum fields the spec
    /// requires for a successful parse.
    pub fn is_minimally_complete(&self) -> bool {
        self.fecha.is_some() && self.numero_factura.is_some() && self.ruc_emisor.is_some()
    }

    pub fn descripcion_factura(&self) -> String {
        self.items
            .iter()
            .take(10)
            .map(|item| item.descripcion.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Parses raw SIFEN XML bytes. Falls back to a byte-level `<DE>...</DE>`
/// extraction and reparse if the document isn't well-formed XML.
#[instrument(skip(raw))]
pub fn parse(raw: &[u8]) -> Result<ParsedInvoice, ParseError> {
    match parse_well_formed(raw) {
        Ok(invoice) => Ok(invoice),
        Err(_) => {
            let recovered = recover_de_fragment(raw).ok_or(ParseError::Unrecoverable)?;
            parse_well_formed(&recovered).map_err(|_| ParseError::Unrecoverable)
        }
    }
}

fn parse_well_formed(raw: &[u8]) -> Result<ParsedInvoice, ParseError> {
    let mut reader = Reader::from_reader(raw);
    reader.config_mut().trim_text(true);

    let mut invoice = ParsedInvoice::default();
    let mut found_de = false;
    let mut path: Vec<String> = Vec::new();
    let mut current_item: Option<InvoiceItem> = None;
    let mut text_buf = String::new();

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                let local = local_name(&e.name().into_inner());
                if local == "DE" {
                    found_de = true;
                    if let Some(id) = e
                        .attributes()
                        .flatten()
                        .find(|a| local_name(a.key.into_inner()) == "Id")
                    {
                        if let Ok(value) = String::from_utf8(id.value.into_owned()) {
                            invoice.cdc = Cdc::parse(&value);
                        }
                    }
                }
                if local == "gCamItem" {
                    current_item = Some(InvoiceItem {
                        descripcion: String::new(),
                        cantidad: Decimal::ZERO,
                        precio_unitario: Decimal::ZERO,
                        total: Decimal::ZERO,
                        iva_rate: 0,
                    });
                }
                path.push(local);
                text_buf.clear();
            }
            Ok(Event::Text(t)) => {
                text_buf.push_str(&t.unescape().unwrap_or_default());
            }
            Ok(Event::End(_)) => {
                let local = path.pop().unwrap_or_default();
                apply_field(&local, &text_buf, &mut invoice, current_item.as_mut());
                if local == "gCamItem" {
                    if let Some(item) = current_item.take() {
                        invoice.items.push(item);
                    }
                }
                text_buf.clear();
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(_) => return Err(ParseError::Unrecoverable),
        }
    }

    if !found_de {
        return Err(ParseError::NoDeElement);
    }

    backfill_gravado(&mut invoice);
    Ok(invoice)
}

fn apply_field(
    local: &str,
    text: &str,
    invoice: &mut ParsedInvoice,
    item: Option<&mut InvoiceItem>,
) {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return;
    }

    match local {
        "dFeEmiDE" => {
            // SIFEN timestamps are `YYYY-MM-DDTHH:MM:SS`; only the date matters here.
            if let Some(date_part) = trimmed.get(0..10) {
                invoice.fecha = chrono::NaiveDate::parse_from_str(date_part, "%Y-%m-%d").ok();
            }
        }
        "dNumDoc" => invoice.numero_factura = Some(trimmed.to_string()),
        "dNumTim" => invoice.timbrado = Some(trimmed.to_string()),
        "dRucEm" => invoice.ruc_emisor = Some(trimmed.to_string()),
        "dNomEmi" => invoice.razon_social_emisor = Some(trimmed.to_string()),
        "dRucRec" => invoice.receptor_ruc = Some(trimmed.to_string()),
        "dNomRec" => invoice.receptor_nombre = Some(trimmed.to_string()),
        "dEmailRec" => invoice.receptor_email = Some(trimmed.to_string()),
        "cMoneOpe" | "dDesMoneOpe" => invoice.moneda = Currency::normalize(trimmed),
        "dTiCam" => invoice.tipo_cambio = parse_decimal(trimmed),
        "dSub5" | "dBasGravIVA5" => invoice.gravado_5 = parse_decimal(trimmed),
        "dSub10" | "dBasGravIVA10" => invoice.gravado_10 = parse_decimal(trimmed),
        "dSubExe" => invoice.exento = parse_decimal(trimmed),
        "dIVA5" => invoice.iva_5 = parse_decimal(trimmed),
        "dIVA10" => invoice.iva_10 = parse_decimal(trimmed),
        "dTotGralOpe" => invoice.total = parse_decimal(trimmed),
        "dDesProSer" => {
            if let Some(item) = item {
                item.descripcion = trimmed.to_string();
            }
        }
        "dCantProSer" => {
            if let Some(item) = item {
                item.cantidad = parse_decimal(trimmed);
            }
        }
        "dPUniProSer" => {
            if let Some(item) = item {
                item.precio_unitario = parse_decimal(trimmed);
            }
        }
        "dTotBruOpeItem" => {
            if let Some(item) = item {
                item.total = parse_decimal(trimmed);
            }
        }
        "iAfecIVA" => {
            if let Some(item) = item {
                // SIFEN: 1=gravado 10%, 2=gravado 5%, 3=exento.
                item.iva_rate = match trimmed {
                    "1" => 10,
                    "2" => 5,
                    _ => 0,
                };
            }
        }
        _ => {}
    }
}

fn parse_decimal(s: &str) -> Decimal {
    s.replace(',', ".").parse().unwrap_or(Decimal::ZERO)
}

/// When only VAT amounts are present (no explicit tax base), derive the
/// base per the fixed IVA rate: `gravado_5 = iva_5 * 20`, `gravado_10 =
/// iva_10 * 10`.
fn backfill_gravado(invoice: &mut ParsedInvoice) {
    if invoice.gravado_5.is_zero() && !invoice.iva_5.is_zero() {
        invoice.gravado_5 = invoice.iva_5 * Decimal::from(20);
    }
    if invoice.gravado_10.is_zero() && !invoice.iva_10.is_zero() {
        invoice.gravado_10 = invoice.iva_10 * Decimal::from(10);
    }
    if invoice.tipo_cambio.is_zero() {
        invoice.tipo_cambio = Decimal::ONE;
    }
}

fn local_name(qualified: &[u8]) -> String {
    let s = String::from_utf8_lossy(qualified);
    s.rsplit(':').next().unwrap_or(&s).to_string()
}

/// Byte-level fallback: extracts the substring from the first `<DE` open
/// tag to the matching `</DE>` close tag, for documents with surrounding
/// garbage or encoding issues that defeat a strict XML parse.
fn recover_de_fragment(raw: &[u8]) -> Option<Vec<u8>> {
    static PATTERN: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    let re = PATTERN.get_or_init(|| {
        Regex::new(r"(?s)<DE[ >].*?</DE>").expect("valid regex")
    });
    let text = String::from_utf8_lossy(raw);
    re.find(&text).map(|m| m.as_str().as_bytes().to_vec())
}

#[cfg(test)]
mod test {
    use super::*;

    const SAMPLE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<rDE xmlns="http://ekuatia.set.gov.py/sifen/xsd">
  <DE Id="01000000019022020050710000000231">
    <gDatGralOpe>
      <dFeEmiDE>2020-02-07T10:00:00</dFeEmiDE>
    </gDatGralOpe>
    <gDtipDE>
      <gCamFE>
        <dNumTim>12345678</dNumTim>
      </gCamFE>
    </gDtipDE>
    <gEmis>
      <dRucEm>80012345</dRucEm>
      <dNomEmi>Acme SA</dNomEmi>
    </gEmis>
    <dNumDoc>0000123</dNumDoc>
    <gDtipDE>
      <gCamItem>
        <dDesProSer>Producto A</dDesProSer>
        <dCantProSer>2</dCantProSer>
        <dPUniProSer>10000</dPUniProSer>
        <dTotBruOpeItem>20000</dTotBruOpeItem>
        <iAfecIVA>1</iAfecIVA>
      </gCamItem>
    </gDtipDE>
    <gTotSub>
      <dTotGralOpe>2200000</dTotGralOpe>
      <dIVA10>200000</dIVA10>
    </gTotSub>
  </DE>
</rDE>"#;

    #[test]
    fn extracts_cdc_from_de_id_attribute() {
        let invoice = parse(SAMPLE.as_bytes()).unwrap();
        assert_eq!(
            invoice.cdc.unwrap().as_str(),
            "01000000019022020050710000000231"
        );
    }

    #[test]
    fn maps_header_fields() {
        let invoice = parse(SAMPLE.as_bytes()).unwrap();
        assert_eq!(invoice.fecha.unwrap().to_string(), "2020-02-07");
        assert_eq!(invoice.numero_factura.as_deref(), Some("0000123"));
        assert_eq!(invoice.ruc_emisor.as_deref(), Some("80012345"));
        assert!(invoice.is_minimally_complete());
    }

    #[test]
    fn derives_gravado_from_iva_when_absent() {
        let invoice = parse(SAMPLE.as_bytes()).unwrap();
        assert_eq!(invoice.gravado_10, Decimal::from(2_000_000));
    }

    #[test]
    fn maps_one_item_per_gcamitem() {
        let invoice = parse(SAMPLE.as_bytes()).unwrap();
        assert_eq!(invoice.items.len(), 1);
        assert_eq!(invoice.items[0].iva_rate, 10);
        assert_eq!(invoice.items[0].descripcion, "Producto A");
    }

    #[test]
    fn byte_level_recovery_handles_garbage_around_de() {
        let garbage = format!("garbled-preamble-not-xml{SAMPLE}trailing-garbage");
        let invoice = parse(garbage.as_bytes()).unwrap();
        assert!(invoice.cdc.is_some());
    }

    #[test]
    fn rejects_non_44_digit_id() {
        let bad = SAMPLE.replace(
            r#"Id="01000000019022020050710000000231""#,
            r#"Id="123""#,
        );
        let invoice = parse(bad.as_bytes()).unwrap();
        assert!(invoice.cdc.is_none());
    }
}
