//! Tests for HRESULT mapping

use clrshim_core::error::{check_hresult, hresult, ShimError};

#[test]
fn test_cordbg_errors_round_trip()
{
    for code in [
        hresult::CORDBG_E_NOT_CLR,
        hresult::CORDBG_E_INCOMPATIBLE_PROTOCOL,
        hresult::CORDBG_E_DEBUG_COMPONENT_MISSING,
        hresult::CORDBG_E_LIBRARY_PROVIDER_ERROR,
        hresult::CORDBG_E_MISSING_DATA_TARGET_INTERFACE,
    ] {
        assert_eq!(ShimError::from_hresult(code).hresult(), code);
    }
}

#[test]
fn test_transient_errors()
{
    let partial = ShimError::from_hresult(hresult::from_win32(hresult::ERROR_PARTIAL_COPY));
    let bad_length = ShimError::from_hresult(hresult::from_win32(hresult::ERROR_BAD_LENGTH));
    assert!(partial.is_transient());
    assert!(bad_length.is_transient());
    assert!(!ShimError::NotClr.is_transient());
    assert!(!ShimError::Timeout.is_transient());
}

#[test]
fn test_unknown_hresult_is_kept_verbatim()
{
    let code = 0x8013_1301_u32 as i32;
    match ShimError::from_hresult(code) {
        ShimError::Hresult(kept) => assert_eq!(kept, code),
        other => panic!("expected Hresult, got {other:?}"),
    }
}

#[test]
fn test_argument_errors()
{
    assert_eq!(ShimError::InvalidArgument("token".into()).hresult(), hresult::E_INVALIDARG);
    assert_eq!(ShimError::Pointer("provider").hresult(), hresult::E_POINTER);
    assert_eq!(
        ShimError::InsufficientBuffer { required: 35 }.hresult(),
        hresult::from_win32(hresult::ERROR_INSUFFICIENT_BUFFER)
    );
    assert_eq!(ShimError::UnsupportedVersionStruct(2).hresult(), hresult::CORDBG_E_UNSUPPORTED_VERSION_STRUCT);
}

#[test]
fn test_check_hresult()
{
    assert!(check_hresult(hresult::S_OK).is_ok());
    assert!(check_hresult(hresult::S_FALSE).is_ok());
    assert!(matches!(check_hresult(hresult::E_NOINTERFACE), Err(ShimError::NoInterface)));
}

#[test]
fn test_error_display()
{
    let error = ShimError::ProcessNotFound(4711);
    assert!(error.to_string().contains("4711"));
    let error = ShimError::Os { api: "dlopen", code: 2 };
    let message = error.to_string();
    assert!(message.contains("dlopen") && message.contains('2'));
}
