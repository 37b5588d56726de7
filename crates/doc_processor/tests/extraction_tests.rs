use doc_processor::{detect_format, extract_docx_text, mine_specifications, DocFormat};

#[test]
fn specification_mining_over_realistic_text() {
    let text = "ТЕХНИЧКА СПЕЦИФИКАЦИЈА\n\
                Предмет: набавка на лекови, CPV 33600000 и медицински средства CPV 33140000-3.\n\
                Понудите се доставуваат до nabavki@bolnica.gov.mk најдоцна до 15.04.2024.\n\
                Дополнителни информации на телефон +389 2 3223 765.\n\
                Краен рок за прашања: 10.04.2024 во 14:00 часот.";

    let specs = mine_specifications(text);

    assert_eq!(specs.cpv_codes, vec!["33140000-3", "33600000"]);
    assert_eq!(specs.emails, vec!["nabavki@bolnica.gov.mk"]);
    assert_eq!(specs.phones.len(), 1);
    assert!(!specs.deadline_phrases.is_empty());
}

#[test]
fn mining_empty_text_yields_empty_block() {
    let specs = mine_specifications("");
    assert!(specs.cpv_codes.is_empty());
    assert!(specs.emails.is_empty());
    assert!(specs.phones.is_empty());
    assert_eq!(specs.spec_length, 0);
}

#[test]
fn format_detection_prefers_magic_bytes_over_extension() {
    // A PDF served under a misleading URL is still a PDF.
    assert_eq!(
        detect_format("https://portal/download?id=7", b"%PDF-1.5 stream"),
        DocFormat::Pdf
    );
    // An OOXML zip without word/ or xl/ entries falls through to the URL.
    assert_eq!(detect_format("https://portal/spec.xlsx", b""), DocFormat::Xlsx);
}

#[test]
fn docx_round_trip_through_zip() {
    let mut buf = Vec::new();
    {
        use std::io::Write;
        let mut writer = zip::ZipWriter::new(std::io::Cursor::new(&mut buf));
        let options: zip::write::SimpleFileOptions = Default::default();
        writer.start_file("word/document.xml", options).unwrap();
        writer
            .write_all(
                r#"<w:document><w:body>
                    <w:p><w:r><w:t>Набавка</w:t></w:r><w:r><w:t>на</w:t></w:r><w:r><w:t>возила</w:t></w:r></w:p>
                </w:body></w:document>"#
                    .as_bytes(),
            )
            .unwrap();
        writer.finish().unwrap();
    }

    assert_eq!(detect_format("x.docx", &buf), DocFormat::Docx);
    assert_eq!(extract_docx_text(&buf).unwrap(), "Набавка на возила");
}
