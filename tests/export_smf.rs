//! End-to-end test: parse a song document, export it, check the bytes.

use pulssi_formats::{load_song, song_to_smf};

const SONG_XML: &str = r#"<song name="one note" tempo="120" ticksperline="6" mastervolume="127" sendsync="0">
  <blocks>
    <block number="0" name="" commandpages="1" tracks="1" length="1">
      <note line="0" track="0" note="49" instrument="1"/>
    </block>
  </blocks>
  <sections><section number="0">0</section></sections>
  <playingsequences>
    <playingsequence number="0" name=""><position number="0">0</position></playingsequence>
  </playingsequences>
  <instruments>
    <instrument number="0" name="lead" midichannel="0" defaultvelocity="100" transpose="0" hold="1"/>
  </instruments>
</song>"#;

#[test]
fn xml_song_exports_to_the_expected_midi_file() {
    let song = load_song(SONG_XML).unwrap();
    let smf = song_to_smf(&song);

    // MThd, format 0, one track, 6 ticks per quarter
    assert_eq!(
        &smf[0..14],
        &[0x4d, 0x54, 0x68, 0x64, 0, 0, 0, 6, 0, 0, 0, 1, 0, 6]
    );
    assert_eq!(&smf[14..18], b"MTrk");

    let body = &smf[22..];
    assert_eq!(
        body,
        &[
            0x00, 0xff, 0x51, 0x03, 0x07, 0xa1, 0x20, // 500000 us per beat
            0x00, 0x90, 0x30, 0x64, // note on ch0 note 48 vel 100
            0x01, 0x80, 0x30, 0x7f, // note off one tick later
            0x00, 0xff, 0x2f, 0x00, // end of track
        ]
    );
}

#[test]
fn exported_length_field_matches_the_body() {
    let song = load_song(SONG_XML).unwrap();
    let smf = song_to_smf(&song);
    let body_len = u32::from_be_bytes([smf[18], smf[19], smf[20], smf[21]]) as usize;
    assert_eq!(smf.len(), 22 + body_len);
}
