//! C9: maps the raw extraction produced by either the XML parser (C7) or
//! the vision extractor (C8) into the canonical [`InvoiceHeader`]. Both
//! sources land in a [`ParsedInvoice`] first (the vision path via its own
//! normalized JSON, deserialized field-for-field into the same struct),
//! so this module only has one conversion to get right.

use chrono::Datelike;
use cuenly_common::model::{InvoiceHeader, SourceTag, TenantId};
use rust_decimal::Decimal;

use crate::xml_parser::ParsedInvoice;

/// Builds the canonical header. `extraction_id` is the caller's concern
/// (used only to mint a fallback warehouse id when neither a CDC nor an
/// email message id is known); this function is pure field mapping.
pub fn map_to_header(
    parsed: &ParsedInvoice,
    tenant: TenantId,
    source: SourceTag,
    email_message_id: Option<String>,
    minio_key: Option<String>,
) -> InvoiceHeader {
    let fecha = parsed.fecha.unwrap_or_else(|| chrono::Utc::now().date_naive());

    let mut tipo_cambio = parsed.tipo_cambio;
    if tipo_cambio.is_zero() {
        tipo_cambio = Decimal::ONE;
    }

    InvoiceHeader {
        tenant,
        cdc: parsed.cdc,
        numero_factura: parsed.numero_factura.clone().unwrap_or_default(),
        timbrado: parsed.timbrado.clone().unwrap_or_default(),
        ruc_emisor: parsed.ruc_emisor.clone().unwrap_or_default(),
        razon_social_emisor: parsed.razon_social_emisor.clone().unwrap_or_default(),
        receptor_ruc: parsed.receptor_ruc.clone(),
        receptor_nombre: parsed.receptor_nombre.clone(),
        receptor_email: parsed.receptor_email.clone(),
        fecha,
        moneda: parsed.moneda.clone(),
        tipo_cambio,
        subtotal_exentas: parsed.exento,
        subtotal_gravada_5: parsed.gravado_5,
        subtotal_gravada_10: parsed.gravado_10,
        iva_5: parsed.iva_5,
        iva_10: parsed.iva_10,
        total: parsed.total,
        descripcion_factura: parsed.descripcion_factura(),
        items: parsed.items.clone(),
        source,
        email_message_id,
        minio_key,
        mes_proceso: format!("{:04}-{:02}", fecha.year(), fecha.month()),
        created_at: cuenly_common::time::TimestampMillis::now(),
    }
}

#[cfg(test)]
mod test {
    use cuenly_common::model::Cdc;

    use super::*;

    fn sample() -> ParsedInvoice {
        let mut parsed = ParsedInvoice {
            fecha: chrono::NaiveDate::from_ymd_opt(2024, 3, 15),
            numero_factura: Some("001-001-0000123".to_string()),
            timbrado: Some("12345678".to_string()),
            ruc_emisor: Some("80012345-1".to_string()),
            razon_social_emisor: Some("Acme SA".to_string()),
            total: Decimal::new(220_0000, 2),
            ..Default::default()
        };
        parsed.cdc = Cdc::parse(&"1".repeat(44));
        parsed
    }

    #[test]
    fn maps_mes_proceso_from_fecha() {
        let header = map_to_header(&sample(), TenantId("t1".to_string()), SourceTag::XmlNativo, None, None);
        assert_eq!(header.mes_proceso, "2024-03");
    }

    #[test]
    fn defaults_missing_tipo_cambio_to_one() {
        let header = map_to_header(&sample(), TenantId("t1".to_string()), SourceTag::XmlNativo, None, None);
        assert_eq!(header.tipo_cambio, Decimal::ONE);
    }

    #[test]
    fn preserves_explicit_tipo_cambio() {
        let mut parsed = sample();
        parsed.tipo_cambio = Decimal::new(7300, 0);
        let header = map_to_header(&parsed, TenantId("t1".to_string()), SourceTag::OpenaiVision, None, None);
        assert_eq!(header.tipo_cambio, Decimal::new(7300, 0));
    }

    #[test]
    fn falls_back_to_empty_strings_for_missing_optional_identifiers() {
        let parsed = ParsedInvoice::default();
        let header = map_to_header(&parsed, TenantId("t1".to_string()), SourceTag::Email, None, None);
        assert_eq!(header.numero_factura, "");
        assert_eq!(header.timbrado, "");
        assert!(header.receptor_ruc.is_none());
    }
}
